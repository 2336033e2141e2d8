// 该文件是 CardRelay 项目的一部分。
// src/detection/workflow.rs - 托管识别工作流
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

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl,
  detection::{RecognizeError, Recognizer},
};

const WORKFLOW_SCHEMES: [&str; 2] = ["https", "http"];
const API_KEY_QUERY: &str = "api_key";

#[derive(Error, Debug)]
pub enum WorkflowError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 通过 HTTP 调用托管的扑克牌识别工作流
///
/// 每次调用只请求一次，不重试，也不设置额外的超时。
pub struct WorkflowRecognizer {
  url: Url,
  api_key: Option<String>,
  agent: ureq::Agent,
}

impl FromUrl for WorkflowRecognizer {
  type Error = WorkflowError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !WORKFLOW_SCHEMES.contains(&url.scheme()) {
      error!(
        "URI scheme mismatch: expected one of {:?}, found '{}'",
        WORKFLOW_SCHEMES,
        url.scheme()
      );
      return Err(WorkflowError::SchemeMismatch(url.scheme().to_string()));
    }

    // 凭据可以放在查询参数里，但不保留在地址中，避免被日志打印出来
    let mut api_key = None;
    let mut rest = Vec::new();
    for (k, v) in url.query_pairs() {
      if k == API_KEY_QUERY {
        api_key = Some(v.into_owned());
      } else {
        rest.push((k.into_owned(), v.into_owned()));
      }
    }

    let mut url = url.clone();
    url.set_query(None);
    if !rest.is_empty() {
      url.query_pairs_mut().extend_pairs(rest);
    }

    Ok(WorkflowRecognizer {
      url,
      api_key,
      agent: ureq::AgentBuilder::new().build(),
    })
  }
}

impl WorkflowRecognizer {
  pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
      self.api_key = Some(key);
    }
    self
  }

  pub fn workflow_url(&self) -> &Url {
    &self.url
  }

  pub fn has_api_key(&self) -> bool {
    self.api_key.is_some()
  }

  fn request_body(api_key: &str, image: &str) -> Value {
    json!({
      "api_key": api_key,
      "inputs": {
        "image": { "type": "base64", "value": image }
      }
    })
  }
}

impl Recognizer for WorkflowRecognizer {
  fn recognize(&self, image: &str) -> Result<Value, RecognizeError> {
    let api_key = self.api_key.as_deref().ok_or_else(|| {
      warn!("未配置识别服务凭据，跳过请求");
      RecognizeError::MissingCredential
    })?;

    info!("调用识别工作流: {}", self.url);
    let response = self
      .agent
      .post(self.url.as_str())
      .send_json(Self::request_body(api_key, image));

    match response {
      Ok(response) => {
        debug!("识别服务响应状态: {}", response.status());
        response
          .into_json::<Value>()
          .map_err(|e| RecognizeError::Decode(e.to_string()))
      }
      Err(ureq::Error::Status(status, response)) => {
        let body = response.into_string().unwrap_or_default();
        error!("识别服务返回错误状态 {}", status);
        Err(RecognizeError::Status { status, body })
      }
      Err(ureq::Error::Transport(transport)) => {
        error!("识别服务请求失败: {}", transport);
        Err(RecognizeError::Transport(transport.to_string()))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_non_http_scheme() {
    let url = Url::parse("ftp://example.com/workflow").unwrap();
    assert!(matches!(
      WorkflowRecognizer::from_url(&url),
      Err(WorkflowError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn api_key_is_lifted_out_of_query() {
    let url = Url::parse("https://example.com/ws/cards?api_key=secret&version=2").unwrap();
    let recognizer = WorkflowRecognizer::from_url(&url).unwrap();
    assert!(recognizer.has_api_key());
    assert_eq!(
      recognizer.workflow_url().as_str(),
      "https://example.com/ws/cards?version=2"
    );
    assert!(!format!("{}", recognizer.workflow_url()).contains("secret"));
  }

  #[test]
  fn explicit_key_overrides_and_empty_key_is_ignored() {
    let url = Url::parse("https://example.com/ws/cards").unwrap();
    let recognizer = WorkflowRecognizer::from_url(&url).unwrap().with_api_key(Some(String::new()));
    assert!(!recognizer.has_api_key());
    let recognizer = recognizer.with_api_key(Some("k".to_string()));
    assert!(recognizer.has_api_key());
  }

  #[test]
  fn missing_key_fails_without_request() {
    let url = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
    let recognizer = WorkflowRecognizer::from_url(&url).unwrap();
    assert!(matches!(
      recognizer.recognize("QUJD"),
      Err(RecognizeError::MissingCredential)
    ));
  }

  #[test]
  fn request_body_wraps_base64_input() {
    let body = WorkflowRecognizer::request_body("k", "QUJD");
    assert_eq!(body["api_key"], "k");
    assert_eq!(body["inputs"]["image"]["type"], "base64");
    assert_eq!(body["inputs"]["image"]["value"], "QUJD");
  }
}
