//! Plan hash: a stable 64-bit FNV-1a fingerprint of a blueprint's shape.
//!
//! Stability across independent builds of the same description is required
//! for observability dashboards (§4.1) — the hash is part of every exported
//! activity tag, so it must not depend on anything but the blueprint's own
//! declared shape (iteration order of `HashMap`s, allocator addresses, etc.
//! must never leak in).

use super::{BlueprintNode, NodeKind};
use crate::fnv::Fnv1a64;

const FIELD_SEP: u8 = 0x1F;

/// 64-bit FNV-1a over the ASCII concatenation of `(flow_name, 0x1F, nodes...)`.
///
/// Each node contributes `kind-byte || name || 0x1F || stage_name || 0x1F ||
/// module_type || 0x1F || join_output_type`, matching the bit-exact contract
/// in spec §4.1.
pub fn plan_hash(flow_name: &str, nodes: &[BlueprintNode]) -> u64 {
    let mut acc = Fnv1a64::new();
    acc.write(flow_name.as_bytes()).write_u8(FIELD_SEP);

    for node in nodes {
        let kind_byte = match node.kind {
            NodeKind::Step => b'S',
            NodeKind::Join => b'J',
        };
        acc.write_u8(kind_byte);
        acc.write(node.name.as_bytes()).write_u8(FIELD_SEP);
        acc.write(node.stage_name.as_deref().unwrap_or("").as_bytes())
            .write_u8(FIELD_SEP);
        acc.write(node.module_type.as_deref().unwrap_or("").as_bytes())
            .write_u8(FIELD_SEP);
        acc.write(node.join_output_type.as_deref().unwrap_or("").as_bytes())
            .write_u8(FIELD_SEP);
    }

    acc.finish()
}
