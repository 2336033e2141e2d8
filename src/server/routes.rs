// 该文件是 CardRelay 项目的一部分。
// src/server/routes.rs - 请求路由
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

use std::io::Read;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Request, Response};
use tracing::{debug, error, info, warn};
use url::Url;

use super::AppState;
use crate::relay::{RelayError, Timestamp};

/// 请求体上限，base64 编码的照片不会超过这个大小
const MAX_BODY: usize = 10 * 1024 * 1024;

struct Reply {
  status: u16,
  body: Option<Value>,
}

impl Reply {
  fn ok(body: Value) -> Self {
    Reply {
      status: 200,
      body: Some(body),
    }
  }

  fn fail(status: u16, message: &str) -> Self {
    Reply {
      status,
      body: Some(json!({ "success": false, "message": message })),
    }
  }

  fn no_content() -> Self {
    Reply {
      status: 204,
      body: None,
    }
  }
}

#[derive(Deserialize)]
struct PinBody {
  #[serde(default)]
  pin: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
  #[serde(default)]
  image: Option<String>,
  #[serde(default)]
  timestamp: Option<String>,
  #[serde(default)]
  detect_cards: bool,
}

#[derive(Deserialize)]
struct ImageBody {
  #[serde(default)]
  image: Option<String>,
}

fn header(name: &str, value: &str) -> Option<Header> {
  Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

pub(super) fn respond(state: &AppState, mut request: Request) {
  let started = Instant::now();
  let reply = handle(state, &mut request);
  debug!(
    "{} {} -> {}，耗时: {:.2?}",
    request.method(),
    request.url(),
    reply.status,
    started.elapsed()
  );

  let body = reply.body.map(|v| v.to_string()).unwrap_or_default();
  let mut response = Response::from_string(body).with_status_code(reply.status);
  let headers = [
    header("Content-Type", "application/json"),
    header("Access-Control-Allow-Origin", "*"),
    header("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    header("Access-Control-Allow-Headers", "Content-Type"),
  ];
  for h in headers.into_iter().flatten() {
    response.add_header(h);
  }

  if let Err(e) = request.respond(response) {
    error!("发送响应失败: {}", e);
  }
}

fn handle(state: &AppState, request: &mut Request) -> Reply {
  let url = match Url::parse("http://localhost/").and_then(|base| base.join(request.url())) {
    Ok(url) => url,
    Err(e) => {
      warn!("无法解析请求路径 {}: {}", request.url(), e);
      return Reply::fail(400, "Invalid request path");
    }
  };

  let method = request.method().clone();
  match (&method, url.path()) {
    (Method::Options, _) => Reply::no_content(),
    (Method::Get, "/api/health") => health(state),
    (Method::Post, "/api/verify-pin") => with_body(request, |body| verify_pin(state, body)),
    (Method::Post, "/api/upload-image") => with_body(request, |body| upload_image(state, body)),
    (Method::Get, "/api/latest-image") => latest_image(state, &url),
    (Method::Post, "/api/test-detection") => with_body(request, |body| test_detection(state, body)),
    (Method::Get, "/api/detection-config") => detection_config(state),
    _ => Reply::fail(404, "Not found"),
  }
}

fn with_body<T: DeserializeOwned>(request: &mut Request, f: impl FnOnce(T) -> Reply) -> Reply {
  if request.body_length().is_some_and(|len| len > MAX_BODY) {
    warn!("请求体过大: {:?} 字节", request.body_length());
    return Reply::fail(413, "Payload too large");
  }

  let mut raw = String::new();
  if let Err(e) = request
    .as_reader()
    .take(MAX_BODY as u64 + 1)
    .read_to_string(&mut raw)
  {
    warn!("读取请求体失败: {}", e);
    return Reply::fail(400, "Unreadable request body");
  }
  if raw.len() > MAX_BODY {
    warn!("请求体过大: 超过 {} 字节", MAX_BODY);
    return Reply::fail(413, "Payload too large");
  }

  match serde_json::from_str(&raw) {
    Ok(body) => f(body),
    Err(e) => {
      warn!("请求体不是有效的 JSON: {}", e);
      Reply::fail(400, "Invalid JSON body")
    }
  }
}

fn health(state: &AppState) -> Reply {
  debug!("健康检查");
  Reply::ok(json!({
    "status": "ok",
    "timestamp": Utc::now(),
    "hasImage": state.store.has_image(),
  }))
}

fn verify_pin(state: &AppState, body: PinBody) -> Reply {
  let matched = body.pin == state.config.pin;
  info!("PIN 验证: 输入 ****，匹配: {}", matched);
  if matched {
    Reply::ok(json!({ "success": true }))
  } else {
    Reply::fail(401, "Invalid PIN")
  }
}

fn upload_image(state: &AppState, body: UploadBody) -> Reply {
  let timestamp = match body.timestamp.as_deref().filter(|t| !t.is_empty()) {
    None => None,
    Some(text) => match Timestamp::parse(text) {
      Ok(t) => Some(t),
      Err(e) => {
        warn!("上传失败: 时间戳 {} 无效: {}", text, e);
        return Reply::fail(400, "Invalid timestamp");
      }
    },
  };

  let image = body.image.unwrap_or_default();
  let size_kb = image.len() / 1024;
  match state.store.upload(image, timestamp, body.detect_cards) {
    Ok(receipt) => {
      info!(
        "图像上传成功: 时间戳 {}，大小 {} KB，识别: {}",
        receipt.timestamp, size_kb, body.detect_cards
      );
      let mut reply = json!({ "success": true, "timestamp": receipt.timestamp });
      if let Some(detection) = receipt.detection {
        reply["detection"] = json!(detection);
      }
      Reply::ok(reply)
    }
    Err(RelayError::InvalidInput(message)) => Reply::fail(400, message),
  }
}

fn latest_image(state: &AppState, url: &Url) -> Reply {
  let max_age = match url.query_pairs().find(|(k, _)| k == "maxAge") {
    None => state.config.image_timeout,
    Some((_, v)) => match v.parse::<u64>() {
      Ok(ms) => Duration::from_millis(ms),
      Err(_) => {
        warn!("maxAge 参数无效: {}", v);
        return Reply::fail(400, "Invalid maxAge");
      }
    },
  };

  let snapshot = state.store.fetch_latest(max_age);
  debug!(
    "图像请求: 上限 {}ms，有图像: {}，有识别结果: {}",
    max_age.as_millis(),
    !snapshot.is_empty(),
    snapshot.detection.is_some()
  );

  Reply::ok(json!({
    "success": true,
    "image": snapshot.image,
    "timestamp": snapshot.timestamp,
    "detection": snapshot.detection,
  }))
}

fn test_detection(state: &AppState, body: ImageBody) -> Reply {
  let Some(image) = body.image.filter(|i| !i.is_empty()) else {
    warn!("识别测试失败: 未提供图像");
    return Reply::fail(400, "No image provided");
  };

  info!("识别测试，图像大小 {} KB", image.len() / 1024);
  let started = Instant::now();
  let result = state.store.detect(&image);
  let duration = started.elapsed();

  let mut reply = json!(result);
  reply["timing"] = json!({ "duration": duration.as_millis() as u64 });
  Reply::ok(reply)
}

fn detection_config(state: &AppState) -> Reply {
  let recognizer = state.store.recognizer();
  Reply::ok(json!({
    "workflowUrl": recognizer.workflow_url().as_str(),
    "hasApiKey": recognizer.has_api_key(),
  }))
}
