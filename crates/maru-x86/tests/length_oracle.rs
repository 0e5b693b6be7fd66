#![cfg(not(target_arch = "wasm32"))]

//! Differential length checks against `iced-x86`.
//!
//! The resolver must agree with a production decoder on instruction byte
//! lengths for every encoding both sides consider well-formed. SIMD
//! encodings are exempt from the random sweep: their validity (and
//! occasionally their shape) depends on mandatory prefixes this legacy
//! front-end deliberately does not model.

use iced_x86::{Code, Decoder, DecoderOptions};
use maru_x86::{resolve, OpFlags, OpMap, ResolvedInst, SizeAttrs};
use proptest::prelude::*;

fn default_attrs(bitness: u32) -> SizeAttrs {
    match bitness {
        16 => SizeAttrs {
            op32: false,
            addr32: false,
        },
        32 => SizeAttrs {
            op32: true,
            addr32: true,
        },
        _ => unreachable!("bitness must be 16 or 32"),
    }
}

/// Encodings excluded from the random differential.
fn oracle_exempt(r: &ResolvedInst) -> bool {
    if r.flags.intersects(OpFlags::SSE | OpFlags::INVALID) {
        return true;
    }
    // The reserved callback hypercall has no upstream decoding.
    matches!((r.map, r.opcode), (OpMap::Map0F, 0x04) | (OpMap::Map0F, 0x24) | (OpMap::Map0F, 0x26))
}

fn iced_len(bytes: &[u8], bitness: u32) -> Option<usize> {
    let mut decoder = Decoder::new(bitness, bytes, DecoderOptions::NO_INVALID_CHECK);
    let inst = decoder.decode();
    if inst.code() == Code::INVALID || inst.len() > bytes.len() {
        return None;
    }
    Some(inst.len())
}

fn check_against_iced(bytes: &[u8], bitness: u32) {
    let Ok(r) = resolve(bytes, 0, default_attrs(bitness)) else {
        return; // truncated or over-long stream
    };
    if oracle_exempt(&r) {
        return;
    }
    let Some(expected) = iced_len(bytes, bitness) else {
        return;
    };
    assert_eq!(
        r.len as usize, expected,
        "length mismatch: bitness={bitness} map={:?} opcode={:#04x} bytes={bytes:02x?}",
        r.map, r.opcode
    );
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_byte_streams_agree_with_iced(
        bitness in prop_oneof![Just(16u32), Just(32u32)],
        bytes in proptest::collection::vec(any::<u8>(), 1..=16),
    ) {
        check_against_iced(&bytes, bitness);
    }
}

/// Directed sweep: one ModRM-bearing opcode against every ModRM byte, in
/// both addressing modes, with every SIB byte for the forms that take one.
#[test]
fn modrm_grid_agrees_with_iced() {
    let pad = [0u8; 8];
    for bitness in [16u32, 32] {
        for modrm in 0..=255u8 {
            let mut bytes = vec![0x88, modrm];
            bytes.extend_from_slice(&pad);
            check_against_iced(&bytes, bitness);

            if bitness == 32 && modrm >> 6 != 3 && modrm & 7 == 4 {
                for sib in 0..=255u16 {
                    let mut bytes = vec![0x88, modrm, sib as u8];
                    bytes.extend_from_slice(&pad);
                    check_against_iced(&bytes, 32);
                }
            }
        }
    }
}

/// Directed sweep over every one-byte opcode with benign operand bytes.
#[test]
fn primary_map_grid_agrees_with_iced() {
    for bitness in [16u32, 32] {
        for op in 0..=255u8 {
            // 0xC0 ModRM keeps group opcodes in register form so the whole
            // row stays decodable; zero padding supplies any immediates.
            let bytes = [op, 0xC0, 0, 0, 0, 0, 0, 0, 0, 0];
            check_against_iced(&bytes, bitness);
        }
    }
}

/// Directed sweep over the 0F map.
#[test]
fn two_byte_map_grid_agrees_with_iced() {
    for bitness in [16u32, 32] {
        for op in 0..=255u8 {
            let bytes = [0x0F, op, 0xC0, 0, 0, 0, 0, 0, 0, 0];
            check_against_iced(&bytes, bitness);
        }
    }
}
