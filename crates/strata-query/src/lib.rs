//! Query-side building blocks for Strata.
//!
//! - [`ParameterBinder`] collects typed bindings, verifies them against the
//!   query's [`ParameterMetadata`](strata_core::ParameterMetadata) and expands
//!   list parameters into a private copy of the text.
//! - [`QueryParameters`] is the immutable bundle handed to execution.
//! - [`QueryPlanCache`] shares compiled plans across sessions.
//! - [`NativeSqlTranslator`] handles native SQL and collection filters.
//! - [`ScrollableCursor`] navigates a row stream by position.

pub mod binder;
pub mod cursor;
pub mod native;
pub mod parameters;
pub mod plan;

pub use binder::{ExpandedQuery, ParameterBinder, TypedList};
pub use cursor::{AfterMoveFn, RowKeyFn, ScrollMode, ScrollableCursor};
pub use native::NativeSqlTranslator;
pub use parameters::{QueryParameters, RowSelection, TypedValue};
pub use plan::{PlanSignature, QueryPlan, QueryPlanCache};
