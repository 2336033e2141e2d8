// 该文件是 CardRelay 项目的一部分。
// src/detection.rs - 扑克牌识别流程
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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::card::Card;

mod workflow;
pub use self::workflow::{WorkflowError, WorkflowRecognizer};

#[derive(Error, Debug)]
pub enum RecognizeError {
  #[error("识别服务不可达: {0}")]
  Transport(String),
  #[error("识别服务返回错误状态 {status}: {body}")]
  Status { status: u16, body: String },
  #[error("无法解析识别服务响应: {0}")]
  Decode(String),
  #[error("识别服务响应结构不符: {0}")]
  MalformedShape(String),
  #[error("未配置识别服务凭据")]
  MissingCredential,
}

/// 外部识别服务
///
/// 实现只负责一次请求并返回响应体，结果的解析与去重由 [`detect`] 完成。
pub trait Recognizer: Send + Sync {
  fn recognize(&self, image: &str) -> Result<Value, RecognizeError>;
}

impl<R: Recognizer + ?Sized> Recognizer for Box<R> {
  fn recognize(&self, image: &str) -> Result<Value, RecognizeError> {
    (**self).recognize(image)
  }
}

impl<R: Recognizer + ?Sized> Recognizer for std::sync::Arc<R> {
  fn recognize(&self, image: &str) -> Result<Value, RecognizeError> {
    (**self).recognize(image)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
  pub success: bool,
  pub cards: Vec<Card>,
  pub total_detections: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl DetectionResult {
  pub fn found(raw: Vec<Card>) -> Self {
    let total_detections = raw.len();
    DetectionResult {
      success: true,
      cards: dedup(raw),
      total_detections,
      error: None,
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    DetectionResult {
      success: false,
      cards: Vec::new(),
      total_detections: 0,
      error: Some(message.into()),
    }
  }

  /// 去重时移除的重复检测数
  pub fn duplicates_removed(&self) -> usize {
    self.total_detections.saturating_sub(self.cards.len())
  }
}

impl From<RecognizeError> for DetectionResult {
  fn from(err: RecognizeError) -> Self {
    DetectionResult::failed(err.to_string())
  }
}

/// 去掉 `data:image/...;base64,` 前缀
pub fn strip_data_uri(image: &str) -> &str {
  if image.starts_with("data:") {
    if let Some((_, payload)) = image.split_once(";base64,") {
      return payload;
    }
  }
  image
}

/// 按响应中的声明顺序扫描各个输出，返回第一个带 `predictions` 数组的条目
///
/// 全部不匹配时返回空切片，这不算错误。
pub fn find_predictions(outputs: &serde_json::Map<String, Value>) -> &[Value] {
  for (name, output) in outputs {
    if let Some(predictions) = output.get("predictions").and_then(Value::as_array) {
      debug!("在输出 {} 中找到 {} 个预测", name, predictions.len());
      return predictions;
    }
  }
  debug!("没有输出包含预测数组");
  &[]
}

/// 取出响应中的输出集合
///
/// `outputs` 可以是对象，也可以是按输入图像排列的数组（取第一个，空数组视为没有输出）。
fn outputs_of(response: &Value) -> Result<Option<&serde_json::Map<String, Value>>, RecognizeError> {
  let outputs = response
    .get("outputs")
    .ok_or_else(|| RecognizeError::MalformedShape("缺少 outputs 字段".to_string()))?;

  let outputs = match outputs {
    Value::Array(items) => match items.first() {
      Some(first) => first,
      None => return Ok(None),
    },
    other => other,
  };

  outputs
    .as_object()
    .map(Some)
    .ok_or_else(|| RecognizeError::MalformedShape("outputs 不是对象".to_string()))
}

/// 从识别响应中解析原始检测列表（未去重）
pub fn parse_predictions(response: &Value) -> Result<Vec<Card>, RecognizeError> {
  let Some(outputs) = outputs_of(response)? else {
    return Ok(Vec::new());
  };

  find_predictions(outputs)
    .iter()
    .map(|item| {
      Card::deserialize(item).map_err(|e| RecognizeError::MalformedShape(format!("预测项无效: {}", e)))
    })
    .collect()
}

/// 同一牌面只保留置信度最高的一个检测
///
/// 置信度相同时保留先出现的；输出顺序为各牌面首次出现的顺序。
pub fn dedup(raw: Vec<Card>) -> Vec<Card> {
  let mut kept: Vec<Card> = Vec::with_capacity(raw.len());
  let mut index: HashMap<String, usize> = HashMap::new();

  for card in raw {
    match index.get(&card.class_label) {
      Some(&slot) => {
        if card.confidence > kept[slot].confidence {
          kept[slot] = card;
        }
      }
      None => {
        index.insert(card.class_label.clone(), kept.len());
        kept.push(card);
      }
    }
  }

  kept
}

/// 对一张图像执行一次识别
///
/// 所有失败都折叠进返回值的 `success = false`，不会向外传播。
pub fn detect<R: Recognizer + ?Sized>(recognizer: &R, image: &str) -> DetectionResult {
  let payload = strip_data_uri(image);
  debug!("发送识别请求，图像大小: {} KB", payload.len() / 1024);

  let now = std::time::Instant::now();
  let result = recognizer
    .recognize(payload)
    .and_then(|response| parse_predictions(&response));
  let elapsed = now.elapsed();

  match result {
    Ok(raw) => {
      let result = DetectionResult::found(raw);
      info!(
        "识别完成，耗时: {:.2?}，检测 {} 个，去重后 {} 张牌",
        elapsed,
        result.total_detections,
        result.cards.len()
      );
      for card in &result.cards {
        debug!("  - {} ({}): {:.2}%", card.class_label, card.name(), card.confidence * 100.0);
      }
      result
    }
    Err(e) => {
      error!("识别失败，耗时: {:.2?}，错误: {}", elapsed, e);
      DetectionResult::from(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  struct Canned(Result<Value, fn() -> RecognizeError>);

  impl Recognizer for Canned {
    fn recognize(&self, _image: &str) -> Result<Value, RecognizeError> {
      match &self.0 {
        Ok(value) => Ok(value.clone()),
        Err(make) => Err(make()),
      }
    }
  }

  struct Echo(std::sync::Mutex<Vec<String>>);

  impl Recognizer for Echo {
    fn recognize(&self, image: &str) -> Result<Value, RecognizeError> {
      self.0.lock().unwrap().push(image.to_string());
      Ok(json!({ "outputs": [] }))
    }
  }

  fn labels(cards: &[Card]) -> Vec<&str> {
    cards.iter().map(|c| c.class_label.as_str()).collect()
  }

  #[test]
  fn dedup_keeps_highest_confidence_in_first_seen_order() {
    let cards = dedup(vec![
      Card::new("KS", 0.9),
      Card::new("KS", 0.95),
      Card::new("QH", 0.8),
    ]);
    assert_eq!(cards, vec![Card::new("KS", 0.95), Card::new("QH", 0.8)]);
  }

  #[test]
  fn dedup_tie_keeps_earlier() {
    let cards = dedup(vec![
      Card::new("2C", 0.7).at(1.0, 1.0),
      Card::new("AD", 0.6),
      Card::new("2C", 0.7).at(9.0, 9.0),
    ]);
    assert_eq!(labels(&cards), vec!["2C", "AD"]);
    assert_eq!(cards[0].x, 1.0);
  }

  #[test]
  fn dedup_law_holds_for_mixed_input() {
    let raw = vec![
      Card::new("AH", 0.3),
      Card::new("5S", 0.9),
      Card::new("AH", 0.8),
      Card::new("5S", 0.1),
      Card::new("AH", 0.5),
      Card::new("JD", 0.4),
    ];
    let cards = dedup(raw.clone());

    let distinct: std::collections::HashSet<_> = raw.iter().map(|c| &c.class_label).collect();
    assert!(cards.len() <= distinct.len());
    for kept in &cards {
      for other in raw.iter().filter(|c| c.class_label == kept.class_label) {
        assert!(kept.confidence >= other.confidence);
      }
    }
    assert_eq!(labels(&cards), vec!["AH", "5S", "JD"]);
  }

  #[test]
  fn strips_data_uri_prefix_only_when_present() {
    assert_eq!(strip_data_uri("data:image/jpeg;base64,QUJD"), "QUJD");
    assert_eq!(strip_data_uri("data:image/png;base64,"), "");
    assert_eq!(strip_data_uri("QUJD"), "QUJD");
  }

  #[test]
  fn first_output_with_predictions_wins() {
    let response = json!({
      "outputs": [{
        "count": 3,
        "visualization": { "type": "base64" },
        "model": { "predictions": [{ "class": "KS", "confidence": 0.9 }] },
        "other": { "predictions": [{ "class": "QH", "confidence": 0.8 }] }
      }]
    });
    let outputs = outputs_of(&response).unwrap().unwrap();
    let found = find_predictions(outputs);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["class"], "KS");
  }

  #[test]
  fn outputs_without_predictions_are_empty_not_error() {
    let response = json!({ "outputs": { "count": 0, "image": "x" } });
    assert!(parse_predictions(&response).unwrap().is_empty());
    let response = json!({ "outputs": [] });
    assert!(parse_predictions(&response).unwrap().is_empty());
  }

  #[test]
  fn missing_outputs_is_malformed() {
    let err = parse_predictions(&json!({ "error": "nope" })).unwrap_err();
    assert!(matches!(err, RecognizeError::MalformedShape(_)));
    let err = parse_predictions(&json!({ "outputs": 3 })).unwrap_err();
    assert!(matches!(err, RecognizeError::MalformedShape(_)));
  }

  #[test]
  fn detect_counts_raw_and_deduplicated() {
    let recognizer = Canned(Ok(json!({
      "outputs": [{
        "predictions": {
          "image": { "width": 640, "height": 480 },
          "predictions": [
            { "class": "KS", "confidence": 0.9, "x": 10.0, "y": 20.0 },
            { "class": "KS", "confidence": 0.95, "x": 11.0, "y": 21.0 },
            { "class": "QH", "confidence": 0.8, "x": 30.0, "y": 40.0 }
          ]
        }
      }]
    })));

    let result = detect(&recognizer, "data:image/jpeg;base64,QUJD");
    assert!(result.success);
    assert_eq!(result.total_detections, 3);
    assert_eq!(result.duplicates_removed(), 1);
    assert_eq!(
      result.cards,
      vec![Card::new("KS", 0.95).at(11.0, 21.0), Card::new("QH", 0.8).at(30.0, 40.0)]
    );
    assert!(result.error.is_none());
  }

  #[test]
  fn detect_sends_stripped_payload() {
    let recognizer = Echo(std::sync::Mutex::new(Vec::new()));
    let result = detect(&recognizer, "data:image/png;base64,AAAA");
    assert!(result.success);
    assert_eq!(*recognizer.0.lock().unwrap(), vec!["AAAA".to_string()]);
  }

  #[test]
  fn detect_captures_upstream_failure() {
    let recognizer = Canned(Err(|| RecognizeError::Status {
      status: 500,
      body: "boom".to_string(),
    }));
    let result = detect(&recognizer, "QUJD");
    assert!(!result.success);
    assert!(result.cards.is_empty());
    assert_eq!(result.total_detections, 0);
    assert!(!result.error.unwrap_or_default().is_empty());
  }

  #[test]
  fn detect_captures_malformed_prediction() {
    let recognizer = Canned(Ok(json!({
      "outputs": { "model": { "predictions": [{ "confidence": 0.5 }] } }
    })));
    let result = detect(&recognizer, "QUJD");
    assert!(!result.success);
    assert!(result.error.is_some());
  }

  #[test]
  fn result_serializes_camel_case() {
    let ok = serde_json::to_value(DetectionResult::found(vec![Card::new("KS", 0.9)])).unwrap();
    assert_eq!(ok["totalDetections"], 1);
    assert!(ok.get("error").is_none());

    let failed = serde_json::to_value(DetectionResult::failed("down")).unwrap();
    assert_eq!(failed["success"], false);
    assert_eq!(failed["error"], "down");
  }
}
