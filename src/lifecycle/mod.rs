//! 生命周期层
//!
//! - `state_machine`：批次状态邻接表、转换副作用、可用动作
//! - `in_flight`：每批次单写者约束

pub mod in_flight;
pub mod state_machine;

pub use in_flight::{InFlightGuard, InFlightSet};
pub use state_machine::{
    available_actions, is_valid, next_status, transition, LifecycleAction, Transition,
    TransitionEffects,
};
