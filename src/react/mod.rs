//! 认知层：Planner、ReAct 主循环与过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::ReactEvent;
pub use loop_::{react_loop, resume_loop, ReactSession, TurnEnd, MAX_REACT_STEPS, NO_RESPONSE};
pub use planner::{parse_llm_output, Planner};
