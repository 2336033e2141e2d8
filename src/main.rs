// 该文件是 CardRelay 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{Level, info, warn};

use cardrelay::{
  FromUrl,
  detection::WorkflowRecognizer,
  relay::RelayStore,
  server::{RelayServer, ServerConfig},
};

fn main() -> Result<()> {
  let args = args::Args::parse();

  let level = if args.debug { Level::DEBUG } else { Level::INFO };
  tracing_subscriber::fmt().with_max_level(level).init();

  info!("CardRelay 图像中转服务");
  info!("监听地址: {}", args.bind_addr());
  info!("PIN 码: ****");
  info!("图像过期时长: {}ms", args.image_timeout);
  info!("调试日志: {}", args.debug);

  let recognizer = WorkflowRecognizer::from_url(&args.workflow)?.with_api_key(args.api_key.clone());
  info!("识别工作流: {}", recognizer.workflow_url());
  if !recognizer.has_api_key() {
    warn!("未配置识别服务凭据，扑克牌识别将返回失败结果");
  }

  let store = RelayStore::new(recognizer);
  let config = ServerConfig {
    pin: args.pin.clone(),
    image_timeout: Duration::from_millis(args.image_timeout),
  };
  let server = RelayServer::bind(&args.bind_addr(), store, config)?;

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
  })?;

  server.serve(rx);

  info!("退出");
  Ok(())
}
