//! Rule-engine validation core: expression language, evaluation scope and
//! the cached batch evaluator.

pub mod engine;
pub mod expr;
pub mod scope;

pub use engine::{
    batch_persist_validation_results, BatchEvaluator, EvalStats, ExposureValidation, RuleEngine,
    RuleSource, ViolationSink,
};
pub use expr::{EvalContext, Value};
pub use scope::ExposureScope;
