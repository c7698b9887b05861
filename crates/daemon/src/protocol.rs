// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol: the fixed banner strings written back to a client after a
//! command finishes (or fails to launch).
//!
//! There is deliberately no framing beyond newline-terminated commands in
//! and raw bytes out -- see spec.md §6. Unlike the original C++, no NUL
//! terminator is appended; these are written as plain bytes.

/// Rejected because the first token did not resolve against the whitelist,
/// or the tokenized command was empty.
pub const INVALID_COMMAND: &str = "Invalid command\n";

/// Header preceding a successfully-launched child's combined output.
pub const SUCCESS_HEADER: &str = "Execution is successful\n";

const STDOUT_HEADER: &str = "*** STDOUT ***\n";
const STDERR_HEADER: &str = "*** STDERR ***\n";

/// Builds the byte sequence written to a client for a completed command.
///
/// `exit_code` is `None` for a clean exit (status 0), `Some(code)` otherwise
/// -- `code` is the process exit code on a normal exit, or `128 + signal`
/// (the shell convention) when the child was killed.
pub fn execution_result(exit_code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stdout.len() + stderr.len() + 128);

    match exit_code {
        None => out.extend_from_slice(SUCCESS_HEADER.as_bytes()),
        Some(code) => {
            out.extend_from_slice(format!("Execution error. Exit code: {code}\n").as_bytes());
        }
    }

    out.extend_from_slice(STDOUT_HEADER.as_bytes());
    out.extend_from_slice(stdout);
    out.extend_from_slice(STDERR_HEADER.as_bytes());
    out.extend_from_slice(stderr);
    out
}
