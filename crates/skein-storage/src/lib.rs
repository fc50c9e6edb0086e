// SPDX-License-Identifier: Apache-2.0
//! skein-storage: the in-memory reference backend.
//!
//! [`MemoryBackend`] implements the full
//! [`StorageBackend`](skein_core::StorageBackend) contract against plain
//! ordered maps. It exists for tests and for worlds small enough to live
//! entirely in memory; database-backed implementations live in their own
//! crates and share nothing with this one but the trait.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::doc_markdown,
    clippy::too_long_first_doc_paragraph,
    clippy::missing_errors_doc,
    clippy::option_if_let_else,
    clippy::type_complexity,
    clippy::redundant_clone,
    clippy::similar_names,
    clippy::many_single_char_names,
    clippy::too_many_lines,
    clippy::trivially_copy_pass_by_ref,
    clippy::use_self
)]

mod memory;

pub use memory::MemoryBackend;
