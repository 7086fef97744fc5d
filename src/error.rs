// SPDX-License-Identifier: BSD-3-Clause

use std::io;

/// Errors that can escape the session engine's boundaries (listener setup,
/// session creation). Per-command failures never reach here: they are
/// resolved inline into a wire response by the command handler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
