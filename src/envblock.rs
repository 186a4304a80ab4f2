//! The flat environment block handed to the native launch call: every
//! `NAME=VALUE` string NUL-terminated, with one extra NUL closing the block.

use crate::error::{Error, Result};
use std::ffi::CString;

/// Serialize `vars` into a launch-ready block, preserving order.
///
/// An empty sequence still produces the double terminator. The first string
/// that cannot be represented (an interior NUL) aborts the whole build with
/// [`Error::Encoding`] naming it; no partial block is returned.
pub fn build<S: AsRef<str>>(vars: &[S]) -> Result<Vec<u8>> {
    let mut block = Vec::with_capacity(vars.len() * 16 + 2);
    for var in vars {
        let var = var.as_ref();
        if var.as_bytes().contains(&0) {
            return Err(Error::Encoding(var.into()));
        }
        block.extend_from_slice(var.as_bytes());
        block.push(0);
    }
    if vars.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}

/// Split a block back into the NUL-terminated entries the exec layer feeds
/// to the native call. Inverse of [`build`].
pub fn entries(block: &[u8]) -> Vec<CString> {
    block
        .split(|byte| *byte == 0)
        .filter(|entry| !entry.is_empty())
        // Split segments cannot contain interior NULs.
        .filter_map(|entry| CString::new(entry).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_double_terminated() {
        assert_eq!(build::<&str>(&[]).unwrap(), b"\0\0");
    }

    #[test]
    fn entries_are_terminated_in_order() {
        assert_eq!(build(&["A=1", "B=2"]).unwrap(), b"A=1\0B=2\0\0");
    }

    #[test]
    fn interior_nul_names_the_string() {
        match build(&["GOOD=1", "BAD=\0"]) {
            Err(Error::Encoding(s)) => assert_eq!(s, "BAD=\0"),
            other => panic!("expected an encoding failure, got {other:?}"),
        }
    }

    #[test]
    fn entries_round_trip() {
        let block = build(&["A=1", "B=two words"]).unwrap();
        let entries = entries(&block);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].to_str().unwrap(), "A=1");
        assert_eq!(entries[1].to_str().unwrap(), "B=two words");
    }

    #[test]
    fn empty_block_has_no_entries() {
        assert!(entries(&build::<&str>(&[]).unwrap()).is_empty());
    }
}
