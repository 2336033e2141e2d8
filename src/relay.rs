// 该文件是 CardRelay 项目的一部分。
// src/relay.rs - 最新图像中转存储
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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::detection::{self, DetectionResult, Recognizer};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RelayError {
  #[error("输入无效: {0}")]
  InvalidInput(&'static str),
}

/// 拍摄时间
///
/// 保留客户端提交的原始文本并原样返回，解析后的时间只用于过期判断。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
  text: Arc<str>,
  at: DateTime<Utc>,
}

impl Timestamp {
  /// 解析 RFC 3339 时间戳
  pub fn parse(text: &str) -> Result<Self, chrono::ParseError> {
    let at = DateTime::parse_from_rfc3339(text)?.with_timezone(&Utc);
    Ok(Timestamp {
      text: Arc::from(text),
      at,
    })
  }

  /// 当前时间，与浏览器 `toISOString()` 一样精确到毫秒
  pub fn now() -> Self {
    let at = Utc::now().trunc_subsecs(3);
    Timestamp {
      text: Arc::from(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
      at,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.text
  }

  pub fn at(&self) -> DateTime<Utc> {
    self.at
  }
}

impl From<DateTime<Utc>> for Timestamp {
  fn from(at: DateTime<Utc>) -> Self {
    Timestamp {
      text: Arc::from(at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
      at,
    }
  }
}

impl std::fmt::Display for Timestamp {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.text)
  }
}

impl Serialize for Timestamp {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.text)
  }
}

/// 槽位中保存的记录，图像与时间戳总是同时存在
#[derive(Debug)]
struct StoredImage {
  image: Arc<str>,
  captured_at: Timestamp,
  detection: Option<Arc<DetectionResult>>,
  sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReceipt {
  pub timestamp: Timestamp,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detection: Option<Arc<DetectionResult>>,
}

/// 读取到的最新图像；过期或不存在时三个字段都为空
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Snapshot {
  pub image: Option<Arc<str>>,
  pub timestamp: Option<Timestamp>,
  pub detection: Option<Arc<DetectionResult>>,
}

impl Snapshot {
  pub fn is_empty(&self) -> bool {
    self.image.is_none()
  }
}

/// 单槽位的最新图像存储
///
/// 每个进程创建一次，以引用形式交给各个请求处理线程。
/// 锁只在替换或读取槽位时持有，识别请求在锁外进行。
/// 每次上传在开始时领取递增的序号，槽位只接受序号更大的记录，
/// 因此最后发起的上传总是胜出，即使更早的上传因识别较慢而更晚完成。
pub struct RelayStore<R> {
  slot: Mutex<Option<StoredImage>>,
  sequence: AtomicU64,
  recognizer: R,
}

impl<R: Recognizer> RelayStore<R> {
  pub fn new(recognizer: R) -> Self {
    RelayStore {
      slot: Mutex::new(None),
      sequence: AtomicU64::new(0),
      recognizer,
    }
  }

  pub fn recognizer(&self) -> &R {
    &self.recognizer
  }

  fn slot(&self) -> MutexGuard<'_, Option<StoredImage>> {
    // 槽位只是普通数据，持锁线程崩溃也不会留下不一致状态
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// 保存一张新图像
  ///
  /// `timestamp` 缺省时取当前时间。`detect` 为真时先同步执行识别，
  /// 识别失败只体现在结果的 `success = false` 中，上传本身仍然成功。
  pub fn upload(
    &self,
    image: String,
    timestamp: Option<Timestamp>,
    detect: bool,
  ) -> Result<UploadReceipt, RelayError> {
    if image.is_empty() {
      warn!("上传失败: 未提供图像");
      return Err(RelayError::InvalidInput("No image provided"));
    }

    let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
    let captured_at = timestamp.unwrap_or_else(Timestamp::now);
    debug!(
      "收到上传 #{}: 时间戳 {}，图像大小 {} KB，识别: {}",
      sequence,
      &captured_at,
      image.len() / 1024,
      detect
    );

    let detection = detect.then(|| Arc::new(detection::detect(&self.recognizer, &image)));

    let record = StoredImage {
      image: Arc::from(image),
      captured_at: captured_at.clone(),
      detection: detection.clone(),
      sequence,
    };

    {
      let mut slot = self.slot();
      let newer = slot
        .as_ref()
        .map(|current| current.sequence)
        .filter(|&current| current > sequence);
      match newer {
        Some(current) => warn!(
          "上传 #{} 完成时槽位已被更晚发起的上传 #{} 占用，丢弃",
          sequence, current
        ),
        None => *slot = Some(record),
      }
    }

    debug!("上传 #{} 已写入，时间戳 {}", sequence, captured_at);
    Ok(UploadReceipt {
      timestamp: captured_at,
      detection,
    })
  }

  /// 读取最新图像，超过 `max_age` 的记录视为过期
  pub fn fetch_latest(&self, max_age: Duration) -> Snapshot {
    self.fetch_latest_at(max_age, Utc::now())
  }

  /// 以 `now` 为当前时间读取最新图像
  ///
  /// 过期只影响本次读取的结果，槽位中的记录不会被删除。
  pub fn fetch_latest_at(&self, max_age: Duration, now: DateTime<Utc>) -> Snapshot {
    let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
    let slot = self.slot();

    let Some(stored) = slot.as_ref() else {
      debug!("没有图像");
      return Snapshot::default();
    };

    let age = now.signed_duration_since(stored.captured_at.at());
    if age > max_age {
      debug!(
        "图像已过期: 时长 {}s，上限 {}s",
        age.num_seconds(),
        max_age.num_seconds()
      );
      return Snapshot::default();
    }

    debug!("返回图像: 时长 {}s", age.num_seconds());
    Snapshot {
      image: Some(stored.image.clone()),
      timestamp: Some(stored.captured_at.clone()),
      detection: stored.detection.clone(),
    }
  }

  /// 只识别不保存
  pub fn detect(&self, image: &str) -> DetectionResult {
    detection::detect(&self.recognizer, image)
  }

  /// 槽位中是否有记录（不考虑过期）
  pub fn has_image(&self) -> bool {
    self.slot().is_some()
  }
}
