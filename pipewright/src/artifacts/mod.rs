//! Host-resident artifact storage.
//!
//! Every artifact is a directory `<root>/<name>/`. Saving `rel` from a job
//! copies it to `<root>/<name>/<rel>`, so several paths saved under one name
//! never collide. Restoring copies the whole `<root>/<name>/` tree into the
//! job directory, rooted at an optional relative target.

mod manifest;
mod store;

pub use manifest::ArtifactManifest;
pub use store::{validate_relative_path, ArtifactStore};
