// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Whitespace tokenization for command lines.
//!
//! Splits on runs of space/tab only, matching `boost::tokenizer` with
//! `char_separator<char>(" \t")` in the original implementation. Deliberately
//! not `str::split_whitespace`, which also treats `\n`/`\r` as separators —
//! irrelevant here since the caller has already split on `\n`, but worth
//! keeping explicit since a command can theoretically still contain a `\r`.

/// Splits `cmd` into argv-style tokens on runs of space/tab.
///
/// An empty or all-whitespace input yields a single empty-string token, so
/// callers can distinguish "tokenized to nothing usable" (attempted, but
/// invalid) from "nothing to attempt".
pub fn tokenize(cmd: &str) -> Vec<String> {
    let tokens: Vec<String> = cmd
        .split(|c| c == ' ' || c == '\t')
        .filter(|tok| !tok.is_empty())
        .map(str::to_owned)
        .collect();

    if tokens.is_empty() {
        vec![String::new()]
    } else {
        tokens
    }
}
