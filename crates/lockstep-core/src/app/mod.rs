//! App - アプリケーション層
//!
//! ports を組み合わせて協調実行を組み立てます。
//!
//! # 主要コンポーネント
//! - **JobRegistry**: ジョブのライフサイクルとペアの排他
//! - **StepPipeline**: ステップの順次実行（pause / resume / stop）
//! - **ReadinessSupervisor**: 制御エージェントの復旧
//! - **WorkerCoordinator**: ペア単位のバッチ実行

pub mod coordinator;
pub mod pipeline;
pub mod readiness;
pub mod registry;
pub mod status;
pub mod steps;

// 主要な型を再エクスポート
pub use self::coordinator::{ScriptFactory, WorkerCoordinator};
pub use self::pipeline::{PipelineAbort, PipelineHandle, ProgressFn, Step, StepPipeline};
pub use self::readiness::{ReadinessPolicy, ReadinessReport, ReadinessSupervisor};
pub use self::registry::JobRegistry;
pub use self::status::RegistryCounts;
