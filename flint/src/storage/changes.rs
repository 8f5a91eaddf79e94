//! Changeset encoding.
//!
//! A changeset lists what one commit wrote, so another copy of the table
//! can be brought up to date by replaying it. Integers are varints
//! ([`pack_uint`]) and strings are length-prefixed ([`pack_string`]).
//!
//! ```text
//! block list:  2 name block_size (n+1 block)* 0
//! base file:   1 name letter len bytes
//! ```

use std::io::Write;

use crate::storage::base::BaseLetter;
use crate::storage::codec::{pack_string, pack_uint, unpack_uint};

/// Marks a base file entry.
pub const BASE_ENTRY: u64 = 1;
/// Marks a list of changed blocks.
pub const BLOCK_LIST: u64 = 2;

pub fn write_block_list_header(
    out: &mut dyn Write,
    name: &str,
    block_size: usize,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    pack_uint(&mut buf, BLOCK_LIST);
    pack_string(&mut buf, name.as_bytes());
    pack_uint(&mut buf, block_size as u64);
    out.write_all(&buf)
}

/// One changed block. Block numbers are stored plus one so 0 can end the
/// list.
pub fn write_block_entry(out: &mut dyn Write, n: u32, block: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(5);
    pack_uint(&mut buf, u64::from(n) + 1);
    out.write_all(&buf)?;
    out.write_all(block)
}

pub fn write_end(out: &mut dyn Write) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(1);
    pack_uint(&mut buf, 0);
    out.write_all(&buf)
}

pub fn write_base_entry(
    out: &mut dyn Write,
    name: &str,
    letter: BaseLetter,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    pack_uint(&mut buf, BASE_ENTRY);
    pack_string(&mut buf, name.as_bytes());
    buf.push(letter.as_char() as u8);
    pack_string(&mut buf, bytes);
    out.write_all(&buf)
}

/// A decoded changeset entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEntry {
    Blocks {
        name: String,
        block_size: usize,
        blocks: Vec<(u32, Vec<u8>)>,
    },
    Base {
        name: String,
        letter: char,
        bytes: Vec<u8>,
    },
}

/// Decode a whole changeset. Returns `None` if it is malformed.
#[must_use]
pub fn parse_changes(mut input: &[u8]) -> Option<Vec<ChangeEntry>> {
    let mut entries = Vec::new();
    while !input.is_empty() {
        let kind = unpack_uint(&mut input)?;
        let name = String::from_utf8(take_string(&mut input)?.to_vec()).ok()?;
        match kind {
            BLOCK_LIST => {
                let block_size = usize::try_from(unpack_uint(&mut input)?).ok()?;
                let mut blocks = Vec::new();
                loop {
                    let n = unpack_uint(&mut input)?;
                    if n == 0 {
                        break;
                    }
                    let block = take(&mut input, block_size)?;
                    blocks.push((u32::try_from(n - 1).ok()?, block.to_vec()));
                }
                entries.push(ChangeEntry::Blocks {
                    name,
                    block_size,
                    blocks,
                });
            }
            BASE_ENTRY => {
                let letter = char::from(*take(&mut input, 1)?.first()?);
                let bytes = take_string(&mut input)?.to_vec();
                entries.push(ChangeEntry::Base {
                    name,
                    letter,
                    bytes,
                });
            }
            _ => return None,
        }
    }
    Some(entries)
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if input.len() < len {
        return None;
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Some(head)
}

fn take_string<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = usize::try_from(unpack_uint(input)?).ok()?;
    take(input, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_list_layout() {
        let mut out = Vec::new();
        write_block_list_header(&mut out, "t", 4).expect("header");
        write_block_entry(&mut out, 0, &[9, 9, 9, 9]).expect("entry");
        write_end(&mut out).expect("end");
        assert_eq!(out, vec![2, 1, b't', 4, 1, 9, 9, 9, 9, 0]);
    }

    #[test]
    fn test_parse_changes() {
        let mut out = Vec::new();
        write_block_list_header(&mut out, "postlist", 2).expect("header");
        write_block_entry(&mut out, 7, &[1, 2]).expect("entry");
        write_end(&mut out).expect("end");
        write_base_entry(&mut out, "postlist", BaseLetter::B, b"base").expect("base");

        let entries = parse_changes(&out).expect("parse");
        assert_eq!(
            entries,
            vec![
                ChangeEntry::Blocks {
                    name: "postlist".to_string(),
                    block_size: 2,
                    blocks: vec![(7, vec![1, 2])],
                },
                ChangeEntry::Base {
                    name: "postlist".to_string(),
                    letter: 'B',
                    bytes: b"base".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_truncated() {
        let mut out = Vec::new();
        write_block_list_header(&mut out, "t", 8).expect("header");
        write_block_entry(&mut out, 0, &[0; 8]).expect("entry");
        assert_eq!(parse_changes(&out[..out.len() - 3]), None);
    }
}
