//! `nodes` crate: the node graph vocabulary and the per-type decision procedures.
//!
//! A node never talks to storage. [`decide`] is a pure function of the node,
//! the contact and the clock; the side effect it returns is carried out by the
//! scheduler through the collaborator traits in [`traits`].

pub mod conditions;
pub mod decision;
pub mod error;
pub mod hash;
pub mod http;
pub mod mock;
pub mod model;
pub mod traits;

pub use conditions::Condition;
pub use decision::{decide, Decision, DecisionInput, SideEffect};
pub use error::NodeError;
pub use model::{BranchPath, DelayUnit, Node, NodeKind, Variant};
pub use traits::{ContactAttributes, ContactLookup, ExecutionContext, ListManager, MessageSender};
