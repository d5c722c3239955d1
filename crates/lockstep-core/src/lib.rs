//! lockstep-core
//!
//! Coordinated multi-device runs: pairs of participants rendezvous at barriers
//! around a scripted action, under a job registry that keeps one active job per
//! pair.
//!
//! # モジュール構成
//! - **cancel**: 協調的キャンセル（CancelToken）
//! - **config**: JSON 設定
//! - **domain**: ドメインモデル（ids, job, barrier, step, outcome, errors）
//! - **ports**: 抽象化レイヤー（Barrier, DeviceCapability, ControlAgent, Clock, TelemetrySink）
//! - **app**: アプリケーションロジック（registry, pipeline, readiness, coordinator）
//! - **impls**: 実装（InMemoryBarrier, FileBarrier, AdbControlAgent, Scripted*）

pub mod app;
pub mod cancel;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use cancel::CancelToken;
pub use config::LockstepConfig;
pub use domain::errors::{ErrorKind, LockstepError};
