//! Plan execution
//!
//! The [`PlanExecutor`] is the only component that turns a failure into a
//! terminal run state. Everything it needs is injected through
//! [`Collaborators`], built leaf-first by the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! let executor = PlanExecutor::new(
//!     Collaborators {
//!         motion,
//!         test_station: Some(station),
//!         translator: ActionTranslator::from_settings(&settings),
//!         vision: None,
//!         frames: None,
//!         plans,
//!         store: store.clone(),
//!     },
//!     &settings.executor,
//! );
//!
//! executor.start();
//! executor.stop();   // pauses at the next phase boundary
//! executor.start();  // resumes where it stopped
//! ```

pub mod executor;

pub use executor::{
    Collaborators, ExecutionCursor, Phase, PlanExecutor, StartOutcome, DONE_TASK,
};
