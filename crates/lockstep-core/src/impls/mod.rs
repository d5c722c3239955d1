//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryBarrier**: 同一プロセス内のバリア
//! - **FileBarrier**: ディレクトリ共有によるプロセス間バリア
//! - **AdbControlAgent**: adb 経由の制御エージェント管理
//! - **ScriptedDevice / ScriptedControlAgent / ScriptedConnector**: シミュレーション
//! - **TracingSink / MemorySink**: TelemetrySink

pub mod adb_agent;
pub mod file_barrier;
pub mod inmem_barrier;
pub mod scripted_device;
pub mod telemetry;

pub use self::adb_agent::AdbControlAgent;
pub use self::file_barrier::FileBarrier;
pub use self::inmem_barrier::InMemoryBarrier;
pub use self::scripted_device::{ScriptedConnector, ScriptedControlAgent, ScriptedDevice};
pub use self::telemetry::{MemorySink, TracingSink};
