//! Core data model.
//!
//! A task is a unit of requested generation work with one lifecycle from
//! `Pending` to a terminal status. Shots are the ordered visual units of a
//! project's storyboard, either authored directly or produced in bulk when a
//! storyboard task succeeds.

pub mod shot;
pub mod task;
pub mod worker;

pub use shot::{NewProject, Project, Shot, ShotStatus};
pub use task::{
    NewTask, ShotGenParams, StoryboardParams, Task, TaskPayload, TaskStatus, TaskType,
};
pub use worker::{WorkerRequest, WorkerResponse, WorkerStatus};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(
    /// Identifier of a [`Task`]. Generated at creation, immutable.
    TaskId
);
id_newtype!(
    /// Identifier of a [`Shot`].
    ShotId
);
id_newtype!(
    /// Identifier of a [`Project`].
    ProjectId
);
