// 该文件是 CardRelay 项目的一部分。
// src/args.rs - 项目参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::{ArgAction, Parser, builder::BoolishValueParser};
use url::Url;

pub const DEFAULT_WORKFLOW: &str =
  "https://serverless.roboflow.com/mod2133/workflows/detect-playing-cards";

/// CardRelay 项目参数配置
///
/// 每个参数都可以通过同名环境变量设置。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听端口
  #[arg(long, env = "PORT", default_value = "3000", value_name = "PORT")]
  pub port: u16,

  /// 监听地址
  #[arg(long, env = "HOST", default_value = "0.0.0.0", value_name = "HOST")]
  pub host: String,

  /// 访问 PIN 码
  #[arg(long, env = "PIN_CODE", default_value = "1234", value_name = "PIN", hide_env_values = true)]
  pub pin: String,

  /// 图像过期时长（毫秒），读取请求未指定 maxAge 时使用
  #[arg(long, env = "IMAGE_TIMEOUT", default_value = "60000", value_name = "MILLIS")]
  pub image_timeout: u64,

  /// 扑克牌识别工作流地址
  #[arg(long, env = "ROBOFLOW_WORKFLOW_URL", default_value = DEFAULT_WORKFLOW, value_name = "URL")]
  pub workflow: Url,

  /// 识别服务凭据
  #[arg(long, env = "ROBOFLOW_API_KEY", value_name = "KEY", hide_env_values = true)]
  pub api_key: Option<String>,

  /// 输出调试日志（接受 1/0、true/false、yes/no、on/off）
  #[arg(
    long,
    env = "DEBUG",
    action = ArgAction::Set,
    value_parser = BoolishValueParser::new(),
    num_args = 0..=1,
    default_value = "false",
    default_missing_value = "true",
    value_name = "BOOL"
  )]
  pub debug: bool,
}

impl Args {
  pub fn bind_addr(&self) -> String {
    format!("{}:{}", self.host, self.port)
  }
}
