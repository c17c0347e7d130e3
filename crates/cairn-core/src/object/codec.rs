//! Canonical wire encoding for tree, inode, and blob payloads.
//!
//! Every payload is one raw type byte followed by a stream of msgpack
//! property records `[tag, value...]`. Non-repeating metadata tags come
//! first in schema order; `e` records are sorted by entry name and `d`
//! records by offset. Together with msgpack's minimal-width integers this
//! makes the encoding a pure function of semantic content, which is what
//! lets the object ID double as a deduplication key.
//!
//! The decoder skips records with unknown tags, so fields can be added
//! later without breaking older payloads.

use std::io::{Cursor, Read};

use cairn_types::object_id::ObjectId;

use crate::compress::{compress, decompress, Compression};
use crate::crypto::CryptoProvider;
use crate::error::{CairnError, Result};
use crate::object::{ChunkRef, InodeObject, ObjectKind, ObjectPayload, TreeEntry, TreeObject};

fn enc_err<E: std::fmt::Display>(e: E) -> CairnError {
    CairnError::InvalidFormat(format!("encode: {e}"))
}

fn dec_err<E: std::fmt::Display>(e: E) -> CairnError {
    CairnError::InvalidFormat(format!("decode: {e}"))
}

fn write_uint_record(buf: &mut Vec<u8>, tag: &str, value: u64) -> Result<()> {
    rmp::encode::write_array_len(buf, 2).map_err(enc_err)?;
    rmp::encode::write_str(buf, tag).map_err(enc_err)?;
    rmp::encode::write_uint(buf, value).map_err(enc_err)?;
    Ok(())
}

fn write_sint_record(buf: &mut Vec<u8>, tag: &str, value: i64) -> Result<()> {
    rmp::encode::write_array_len(buf, 2).map_err(enc_err)?;
    rmp::encode::write_str(buf, tag).map_err(enc_err)?;
    rmp::encode::write_sint(buf, value).map_err(enc_err)?;
    Ok(())
}

/// Serialize a tree payload. Entries are emitted sorted by name bytes
/// regardless of insertion order.
pub fn encode_tree(tree: &TreeObject) -> Result<Vec<u8>> {
    let mut entries: Vec<&TreeEntry> = tree.entries.iter().collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut buf = Vec::with_capacity(64 + entries.len() * 48);
    buf.push(ObjectKind::Tree as u8);
    write_uint_record(&mut buf, "u", tree.uid as u64)?;
    write_uint_record(&mut buf, "g", tree.gid as u64)?;
    write_uint_record(&mut buf, "m", tree.mode as u64)?;
    for entry in entries {
        rmp::encode::write_array_len(&mut buf, 3).map_err(enc_err)?;
        rmp::encode::write_str(&mut buf, "e").map_err(enc_err)?;
        rmp::encode::write_bin(&mut buf, &entry.name).map_err(enc_err)?;
        rmp::encode::write_bin(&mut buf, entry.child.as_bytes()).map_err(enc_err)?;
    }
    Ok(buf)
}

/// Serialize an inode payload. Chunk records are emitted sorted by offset.
pub fn encode_inode(inode: &InodeObject) -> Result<Vec<u8>> {
    let mut chunks: Vec<&ChunkRef> = inode.chunks.iter().collect();
    chunks.sort_by_key(|c| c.offset);

    let mut buf = Vec::with_capacity(96 + chunks.len() * 48);
    buf.push(ObjectKind::Inode as u8);
    write_uint_record(&mut buf, "s", inode.size)?;
    write_uint_record(&mut buf, "i", inode.inode)?;
    write_uint_record(&mut buf, "u", inode.uid as u64)?;
    write_uint_record(&mut buf, "g", inode.gid as u64)?;
    write_uint_record(&mut buf, "m", inode.mode as u64)?;
    write_sint_record(&mut buf, "ct", inode.ctime_ns)?;
    write_sint_record(&mut buf, "mt", inode.mtime_ns)?;
    for chunk in chunks {
        rmp::encode::write_array_len(&mut buf, 3).map_err(enc_err)?;
        rmp::encode::write_str(&mut buf, "d").map_err(enc_err)?;
        rmp::encode::write_uint(&mut buf, chunk.offset).map_err(enc_err)?;
        rmp::encode::write_bin(&mut buf, chunk.blob.as_bytes()).map_err(enc_err)?;
    }
    Ok(buf)
}

/// Serialize a blob payload wrapping one chunk of file data.
pub fn encode_blob(data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + data.len());
    buf.push(ObjectKind::Blob as u8);
    rmp::encode::write_array_len(&mut buf, 2).map_err(enc_err)?;
    rmp::encode::write_str(&mut buf, "d").map_err(enc_err)?;
    rmp::encode::write_bin(&mut buf, data).map_err(enc_err)?;
    Ok(buf)
}

/// Decode any object payload.
pub fn decode(payload: &[u8]) -> Result<ObjectPayload> {
    if payload.is_empty() {
        return Err(CairnError::InvalidFormat("empty payload".into()));
    }
    let kind = ObjectKind::from_u8(payload[0])?;
    let mut cur = Cursor::new(&payload[1..]);
    match kind {
        ObjectKind::Tree => decode_tree(&mut cur).map(ObjectPayload::Tree),
        ObjectKind::Inode => decode_inode(&mut cur).map(ObjectPayload::Inode),
        ObjectKind::Blob => decode_blob(&mut cur).map(ObjectPayload::Blob),
    }
}

fn at_end(cur: &Cursor<&[u8]>) -> bool {
    cur.position() as usize >= cur.get_ref().len()
}

fn read_tag(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = rmp::decode::read_str_len(cur).map_err(dec_err)? as usize;
    if len > 16 {
        return Err(CairnError::InvalidFormat("oversized record tag".into()));
    }
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes).map_err(dec_err)?;
    String::from_utf8(bytes).map_err(|_| CairnError::InvalidFormat("non-UTF-8 record tag".into()))
}

fn read_u64(cur: &mut Cursor<&[u8]>) -> Result<u64> {
    rmp::decode::read_int(cur).map_err(dec_err)
}

fn read_u32(cur: &mut Cursor<&[u8]>) -> Result<u32> {
    let v = read_u64(cur)?;
    u32::try_from(v).map_err(|_| CairnError::InvalidFormat("integer out of range".into()))
}

fn read_i64(cur: &mut Cursor<&[u8]>) -> Result<i64> {
    rmp::decode::read_int(cur).map_err(dec_err)
}

fn read_bin(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = rmp::decode::read_bin_len(cur).map_err(dec_err)? as usize;
    if len > cur.get_ref().len() {
        return Err(CairnError::InvalidFormat("binary value overruns payload".into()));
    }
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes).map_err(dec_err)?;
    Ok(bytes)
}

fn read_oid(cur: &mut Cursor<&[u8]>) -> Result<ObjectId> {
    let bytes = read_bin(cur)?;
    ObjectId::from_slice(&bytes)
        .ok_or_else(|| CairnError::InvalidFormat("object reference has wrong length".into()))
}

fn expect_values(tag: &str, got: u32, want: u32) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(CairnError::InvalidFormat(format!(
            "record '{tag}' has {got} columns, expected {want}"
        )))
    }
}

fn decode_tree(cur: &mut Cursor<&[u8]>) -> Result<TreeObject> {
    let mut tree = TreeObject::default();
    while !at_end(cur) {
        let n = rmp::decode::read_array_len(cur).map_err(dec_err)?;
        if n == 0 {
            return Err(CairnError::InvalidFormat("empty property record".into()));
        }
        let tag = read_tag(cur)?;
        match tag.as_str() {
            "u" => {
                expect_values(&tag, n, 2)?;
                tree.uid = read_u32(cur)?;
            }
            "g" => {
                expect_values(&tag, n, 2)?;
                tree.gid = read_u32(cur)?;
            }
            "m" => {
                expect_values(&tag, n, 2)?;
                tree.mode = read_u32(cur)?;
            }
            "e" => {
                expect_values(&tag, n, 3)?;
                let name = read_bin(cur)?;
                let child = read_oid(cur)?;
                tree.entries.push(TreeEntry { name, child });
            }
            _ => skip_values(cur, n - 1)?,
        }
    }
    Ok(tree)
}

fn decode_inode(cur: &mut Cursor<&[u8]>) -> Result<InodeObject> {
    let mut inode = InodeObject {
        size: 0,
        inode: 0,
        uid: 0,
        gid: 0,
        mode: 0,
        ctime_ns: 0,
        mtime_ns: 0,
        chunks: Vec::new(),
    };
    while !at_end(cur) {
        let n = rmp::decode::read_array_len(cur).map_err(dec_err)?;
        if n == 0 {
            return Err(CairnError::InvalidFormat("empty property record".into()));
        }
        let tag = read_tag(cur)?;
        match tag.as_str() {
            "s" => {
                expect_values(&tag, n, 2)?;
                inode.size = read_u64(cur)?;
            }
            "i" => {
                expect_values(&tag, n, 2)?;
                inode.inode = read_u64(cur)?;
            }
            "u" => {
                expect_values(&tag, n, 2)?;
                inode.uid = read_u32(cur)?;
            }
            "g" => {
                expect_values(&tag, n, 2)?;
                inode.gid = read_u32(cur)?;
            }
            "m" => {
                expect_values(&tag, n, 2)?;
                inode.mode = read_u32(cur)?;
            }
            "ct" => {
                expect_values(&tag, n, 2)?;
                inode.ctime_ns = read_i64(cur)?;
            }
            "mt" => {
                expect_values(&tag, n, 2)?;
                inode.mtime_ns = read_i64(cur)?;
            }
            "d" => {
                expect_values(&tag, n, 3)?;
                let offset = read_u64(cur)?;
                let blob = read_oid(cur)?;
                inode.chunks.push(ChunkRef { offset, blob });
            }
            _ => skip_values(cur, n - 1)?,
        }
    }
    Ok(inode)
}

fn decode_blob(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let mut data: Option<Vec<u8>> = None;
    while !at_end(cur) {
        let n = rmp::decode::read_array_len(cur).map_err(dec_err)?;
        if n == 0 {
            return Err(CairnError::InvalidFormat("empty property record".into()));
        }
        let tag = read_tag(cur)?;
        match tag.as_str() {
            "d" => {
                expect_values(&tag, n, 2)?;
                data = Some(read_bin(cur)?);
            }
            _ => skip_values(cur, n - 1)?,
        }
    }
    data.ok_or_else(|| CairnError::InvalidFormat("blob payload has no data record".into()))
}

fn skip_values(cur: &mut Cursor<&[u8]>, count: u32) -> Result<()> {
    for _ in 0..count {
        skip_value(cur)?;
    }
    Ok(())
}

fn skip_bytes(cur: &mut Cursor<&[u8]>, count: usize) -> Result<()> {
    let pos = cur.position() as usize;
    if pos + count > cur.get_ref().len() {
        return Err(CairnError::InvalidFormat("value overruns payload".into()));
    }
    cur.set_position((pos + count) as u64);
    Ok(())
}

fn read_len_u8(cur: &mut Cursor<&[u8]>) -> Result<usize> {
    let mut b = [0u8; 1];
    cur.read_exact(&mut b).map_err(dec_err)?;
    Ok(b[0] as usize)
}

fn read_len_u16(cur: &mut Cursor<&[u8]>) -> Result<usize> {
    let mut b = [0u8; 2];
    cur.read_exact(&mut b).map_err(dec_err)?;
    Ok(u16::from_be_bytes(b) as usize)
}

fn read_len_u32(cur: &mut Cursor<&[u8]>) -> Result<usize> {
    let mut b = [0u8; 4];
    cur.read_exact(&mut b).map_err(dec_err)?;
    Ok(u32::from_be_bytes(b) as usize)
}

/// Skip one msgpack value of any shape. Used for forward-compatible
/// decoding of records with unknown tags.
fn skip_value(cur: &mut Cursor<&[u8]>) -> Result<()> {
    use rmp::Marker;

    let marker = rmp::decode::read_marker(cur).map_err(|_| dec_err("bad marker"))?;
    match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Ok(())
        }
        Marker::U8 | Marker::I8 => skip_bytes(cur, 1),
        Marker::U16 | Marker::I16 => skip_bytes(cur, 2),
        Marker::U32 | Marker::I32 | Marker::F32 => skip_bytes(cur, 4),
        Marker::U64 | Marker::I64 | Marker::F64 => skip_bytes(cur, 8),
        Marker::FixStr(len) => skip_bytes(cur, len as usize),
        Marker::Str8 | Marker::Bin8 => {
            let len = read_len_u8(cur)?;
            skip_bytes(cur, len)
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = read_len_u16(cur)?;
            skip_bytes(cur, len)
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = read_len_u32(cur)?;
            skip_bytes(cur, len)
        }
        Marker::FixArray(n) => skip_values(cur, n as u32),
        Marker::Array16 => {
            let n = read_len_u16(cur)?;
            skip_values(cur, n as u32)
        }
        Marker::Array32 => {
            let n = read_len_u32(cur)?;
            skip_values(cur, n as u32)
        }
        Marker::FixMap(n) => skip_values(cur, n as u32 * 2),
        Marker::Map16 => {
            let n = read_len_u16(cur)?;
            skip_values(cur, n as u32 * 2)
        }
        Marker::Map32 => {
            let n = read_len_u32(cur)?;
            skip_values(cur, n as u32 * 2)
        }
        Marker::FixExt1 => skip_bytes(cur, 2),
        Marker::FixExt2 => skip_bytes(cur, 3),
        Marker::FixExt4 => skip_bytes(cur, 5),
        Marker::FixExt8 => skip_bytes(cur, 9),
        Marker::FixExt16 => skip_bytes(cur, 17),
        Marker::Ext8 => {
            let len = read_len_u8(cur)?;
            skip_bytes(cur, len + 1)
        }
        Marker::Ext16 => {
            let len = read_len_u16(cur)?;
            skip_bytes(cur, len + 1)
        }
        Marker::Ext32 => {
            let len = read_len_u32(cur)?;
            skip_bytes(cur, len + 1)
        }
        Marker::Reserved => Err(CairnError::InvalidFormat("reserved msgpack marker".into())),
    }
}

/// Apply the on-wire envelope: compress the plaintext, then seal it.
/// Object IDs are always computed over the plaintext, never this output.
pub fn pack_payload(
    payload: &[u8],
    compression: Compression,
    crypto: &dyn CryptoProvider,
) -> Result<Vec<u8>> {
    crypto.seal(&compress(compression, payload)?)
}

/// Invert `pack_payload`: open, then decompress.
pub fn unpack_payload(data: &[u8], crypto: &dyn CryptoProvider) -> Result<Vec<u8>> {
    decompress(&crypto.open(data)?)
}
