//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（端末、端末上の制御エージェント、共有ストレージ、
//! ログ基盤）へのインターフェースを提供し、実装の詳細を隠蔽します。

pub mod barrier;
pub mod clock;
pub mod control_agent;
pub mod device;
pub mod telemetry;

pub use self::barrier::Barrier;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::control_agent::ControlAgent;
pub use self::device::{
    DeviceCapability, DeviceConnector, DeviceError, KeyCode, PairSpec, ParticipantSpec, Point,
    Selector,
};
pub use self::telemetry::{LogLevel, Metadata, TelemetrySink};
