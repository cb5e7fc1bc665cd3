//! # Pixelmill
//!
//! Image transformation jobs with two execution paths: a single-shot pipeline
//! run in-process, and a CPU stress mode that saturates every local core with
//! a repeated transformation workload. A forwarder hands the same jobs to a
//! remote worker service when heavy work should run elsewhere.
//!
//! # Architecture
//!
//! Every request enters through [`service::Service`], which resolves the
//! caller, validates the request, and routes it:
//!
//! ```text
//!                 ┌── process ──────► imaging::pipeline ──┐
//! request ─► Service ── stress ───────► dispatch::Dispatcher ──► assemble ─► stores
//!                 └── forward / stress_remote ─► forward::RemoteForwarder ─► worker
//! ```
//!
//! Stress units never share mutable state: each one decodes its own copy of the
//! source image, runs until the budget expires, and writes exactly one slot of
//! the result vector. The join point is the only synchronization.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`imaging`] | Operation catalogue, codec, transform backend, ordered pipeline |
//! | [`dispatch`] | Parallel fan-out of stress units on a dedicated thread pool |
//! | [`forward`] | HTTP client for the remote worker: health gate, pass-through, remote stress |
//! | [`assemble`] | Unique output keys and result records for finished jobs |
//! | [`store`] | Blob and record storage behind traits, filesystem and in-memory backends |
//! | [`identity`] | Caller identity as an injected collaborator |
//! | [`service`] | Request validation, visibility rules, and error-to-status mapping |
//! | [`config`] | `pixelmill.toml` loading over stock defaults |
//! | [`types`] | Records and job descriptions shared across modules |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Fork-Join Without Shared State
//!
//! The dispatcher builds its own rayon pool sized to the requested worker count
//! and scopes one task per unit. Each unit owns its image and its result slot,
//! so there are no locks on the hot path and a panicking unit is caught and
//! reported as a failed slot instead of taking the others down.
//!
//! ## Collaborators Are Injected
//!
//! Storage, identity, and the remote worker sit behind traits or constructors
//! taken by [`service::Service`]. The CLI wires the filesystem stores and a
//! static identity; tests wire in-memory stores and a switchable identity.
//!
//! ## Typed Operations at the Boundary
//!
//! Loose JSON operation maps are parsed once into an
//! [`imaging::OperationSet`]. Unknown names and malformed parameters are
//! rejected before any pixel work starts, and the pipeline applies whatever
//! is present in one fixed order regardless of how the request listed it.
//!
//! ## Pure-Rust Imaging
//!
//! Decoding, encoding, and every transformation use the `image` crate. There
//! are no system libraries to install and the binary is self-contained.

pub mod assemble;
pub mod config;
pub mod dispatch;
pub mod forward;
pub mod identity;
pub mod imaging;
pub mod output;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;
