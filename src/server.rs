// 该文件是 CardRelay 项目的一部分。
// src/server.rs - HTTP 接口
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{detection::WorkflowRecognizer, relay::RelayStore};

mod routes;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("无法监听 {addr}: {reason}")]
  Bind { addr: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
  pub pin: String,
  /// 请求未指定 `maxAge` 时使用的过期时长
  pub image_timeout: Duration,
}

pub(crate) struct AppState {
  store: RelayStore<WorkflowRecognizer>,
  config: ServerConfig,
}

pub struct RelayServer {
  server: tiny_http::Server,
  state: Arc<AppState>,
}

impl RelayServer {
  pub fn bind(
    addr: &str,
    store: RelayStore<WorkflowRecognizer>,
    config: ServerConfig,
  ) -> Result<Self, ServerError> {
    let server = tiny_http::Server::http(addr).map_err(|e| ServerError::Bind {
      addr: addr.to_string(),
      reason: e.to_string(),
    })?;
    info!("HTTP 服务监听于 {:?}", server.server_addr().to_ip());

    Ok(RelayServer {
      server,
      state: Arc::new(AppState { store, config }),
    })
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.server.server_addr().to_ip()
  }

  /// 处理请求直到收到停止信号（或发送端被丢弃）
  ///
  /// 每个请求在独立线程中处理，慢速的识别请求不会阻塞其他读取。
  pub fn serve(self, shutdown: Receiver<()>) {
    info!("开始处理请求...");
    loop {
      match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => {
          warn!("停止信号接收，退出服务循环");
          break;
        }
        Err(TryRecvError::Empty) => {}
      }

      let request = match self.server.recv_timeout(POLL_INTERVAL) {
        Ok(Some(request)) => request,
        Ok(None) => continue,
        Err(e) => {
          error!("接收请求失败: {}", e);
          continue;
        }
      };

      debug!("{} {}", request.method(), request.url());
      let state = self.state.clone();
      thread::spawn(move || routes::respond(&state, request));
    }

    info!("服务已停止");
  }
}
