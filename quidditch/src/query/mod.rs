//! Query model: the typed AST the engine executes, the JSON DSL the
//! coordinator accepts, translation/validation between the two, and plan
//! fingerprinting for the plan cache.

pub mod ast;
pub mod dsl;
pub mod fingerprint;
pub mod translate;

pub use ast::{NumericRange, QueryAst, RangeBounds};
pub use dsl::SearchBody;
pub use fingerprint::plan_fingerprint;
pub use translate::{auto_fuzziness, translate_body, TranslatedQuery};
