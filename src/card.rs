// 该文件是 CardRelay 项目的一部分。
// src/card.rs - 扑克牌定义
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

use serde::{Deserialize, Serialize};

/// 一次识别得到的扑克牌
///
/// `class_label` 为点数加花色的编码，例如 `KS`、`10H`。
/// `x`/`y` 原样透传识别服务给出的位置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
  #[serde(rename = "class", alias = "classLabel")]
  pub class_label: String,
  pub confidence: f64,
  #[serde(default)]
  pub x: f64,
  #[serde(default)]
  pub y: f64,
}

impl Card {
  pub fn new(class_label: impl Into<String>, confidence: f64) -> Self {
    Card {
      class_label: class_label.into(),
      confidence,
      x: 0.0,
      y: 0.0,
    }
  }

  pub fn at(mut self, x: f64, y: f64) -> Self {
    self.x = x;
    self.y = y;
    self
  }

  pub fn name(&self) -> String {
    card_name(&self.class_label)
  }
}

fn rank_name(rank: &str) -> &str {
  match rank {
    "A" => "Ace",
    "J" => "Jack",
    "Q" => "Queen",
    "K" => "King",
    other => other,
  }
}

fn suit_name(suit: &str) -> &str {
  match suit {
    "S" => "Spades",
    "H" => "Hearts",
    "D" => "Diamonds",
    "C" => "Clubs",
    other => other,
  }
}

/// 将牌面编码转换为可读名称，例如 `KS` -> `King of Spades`
///
/// 无法识别的点数或花色原样保留；长度不足两个字符的编码直接返回。
pub fn card_name(label: &str) -> String {
  if label.chars().count() < 2 {
    return label.to_string();
  }

  // 10 是唯一的两位点数
  let (rank, rest) = if label.starts_with("10") {
    label.split_at(2)
  } else {
    let first = label.chars().next().map(char::len_utf8).unwrap_or(1);
    label.split_at(first)
  };
  let suit: String = rest.chars().take(1).collect();

  format!("{} of {}", rank_name(rank), suit_name(&suit))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn names_face_and_number_cards() {
    assert_eq!(card_name("KS"), "King of Spades");
    assert_eq!(card_name("AH"), "Ace of Hearts");
    assert_eq!(card_name("7D"), "7 of Diamonds");
    assert_eq!(card_name("10C"), "10 of Clubs");
  }

  #[test]
  fn unknown_parts_pass_through() {
    assert_eq!(card_name("XZ"), "X of Z");
    assert_eq!(card_name("K"), "K");
    assert_eq!(card_name(""), "");
  }

  #[test]
  fn deserializes_both_label_spellings() {
    let a: Card = serde_json::from_str(r#"{"class":"QH","confidence":0.8,"x":1.5,"y":2}"#).unwrap();
    let b: Card = serde_json::from_str(r#"{"classLabel":"QH","confidence":0.8}"#).unwrap();
    assert_eq!(a, Card::new("QH", 0.8).at(1.5, 2.0));
    assert_eq!(b, Card::new("QH", 0.8));
  }

  #[test]
  fn serializes_label_as_class() {
    let value = serde_json::to_value(Card::new("KS", 0.95)).unwrap();
    assert_eq!(value["class"], "KS");
    assert!(value.get("class_label").is_none());
  }
}
