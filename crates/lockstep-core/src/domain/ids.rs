//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! Job と Run は ULID (時刻でソート可能な 128-bit ID) を Phantom type で包んだ
//! `Id<T>` を使います。JobId と RunId はコンパイル時に混同できません。
//!
//! # 文字列 ID
//! Pair / Participant / Group は外部から与えられる名前（デバイスのシリアル、
//! バッチ設定のペア名など）なので、文字列の newtype にしています。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "run-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しませんが、
/// コンパイル時に型安全性を提供します。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// 新しい ULID を採番
    pub fn new() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> Default for Id<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

/// Identifier of a Job (one pair's run inside a batch).
pub type JobId = Id<Job>;

/// Identifier of a Run (one batch; groups the jobs started together).
pub type RunId = Id<Run>;

// ========================================
// 文字列 ID
// ========================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Resource pair identifier. At most one active job exists per pair.
    PairId
);

string_id!(
    /// One participant of a pair (usually a device serial).
    ParticipantId
);

string_id!(
    /// Barrier group name. Distinct rounds use distinct group ids.
    GroupId
);

impl GroupId {
    /// 1 バッチ・1 ペア・1 フェーズ ("pre" / "post") ごとのグループ名
    pub fn for_phase(run_id: &RunId, pair_id: &PairId, phase: &str) -> Self {
        Self(format!("{run_id}_{pair_id}_{phase}"))
    }
}
