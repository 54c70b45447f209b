//! Cast instruction selection.
//!
//! The lowering is a table keyed on (source type, destination type).
//! Integer narrowing needs no code at all: the destination just reads the
//! low part of the register. Widening picks `movsx`/`movzx` by the
//! signedness of the source; int-to-float goes through `cvtsi2ss/sd`,
//! widening 8- and 16-bit sources into a general-purpose scratch first
//! because the converters only take 32- and 64-bit inputs. Float-to-int
//! truncates via `cvttss2si`/`cvttsd2si`, and the two float widths convert
//! into each other with `cvtss2sd`/`cvtsd2ss`.

use crate::ir::{Function, Inst, Type};
use std::fmt::Write;

/// Give narrow int-to-float casts the general-purpose scratch register
/// they widen through, as an extra unconstrained result.
pub fn add_scratch(func: &mut Function, inst: Inst) {
    let src_ty = func.operand_type(func.insts[inst].args[0].operand);
    let dst_ty = func.vars[func.insts[inst].ress[0].value].ty;
    if dst_ty.is_real() && !src_ty.is_real() && src_ty.bytes() <= 2 {
        let scratch = func.new_ssa_reg(Type::Int32);
        let res = func.make_res(scratch);
        func.insts[inst].ress.push(res);
    }
}

/// Append the instructions converting `src_str` (of `src_ty`) into
/// `dst_str` (of `dst_ty`) to `out`. `scratch_str` is the widening scratch
/// when `add_scratch` attached one.
pub fn emit_cast(
    out: &mut String,
    src_ty: Type,
    dst_ty: Type,
    src_str: &str,
    dst_str: &str,
    scratch_str: Option<&str>,
    same_color: bool,
) {
    // Same width and class: an ordinary move, dropped when the colors
    // already coincide.
    if src_ty == dst_ty || (src_ty.bytes() == dst_ty.bytes() && src_ty.is_real() == dst_ty.is_real())
    {
        if !same_color {
            let mn = mov_mnemonic(dst_ty);
            let _ = writeln!(out, "\t{}\t{}, {}", mn, src_str, dst_str);
        }
        return;
    }

    match (src_ty.is_real(), dst_ty.is_real()) {
        // Integer to integer.
        (false, false) => {
            if dst_ty.bytes() <= src_ty.bytes() {
                // Narrowing reads the low part; nothing to do when the
                // colors agree, otherwise a move of the destination width.
                if !same_color {
                    let _ = writeln!(out, "\t{}\t{}, {}", mov_mnemonic(dst_ty), src_str, dst_str);
                }
            } else {
                let mn = extend_mnemonic(src_ty, dst_ty);
                let _ = writeln!(out, "\t{}\t{}, {}", mn, src_str, dst_str);
            }
        }
        // Integer to float.
        (false, true) => {
            let cvt = if dst_ty == Type::Real32 {
                "cvtsi2ss"
            } else {
                "cvtsi2sd"
            };
            if src_ty.bytes() <= 2 {
                let scratch = scratch_str.expect("narrow int-to-float cast without scratch");
                let widen = if src_ty.is_signed_int() {
                    match src_ty.bytes() {
                        1 => "movsbl",
                        _ => "movswl",
                    }
                } else {
                    match src_ty.bytes() {
                        1 => "movzbl",
                        _ => "movzwl",
                    }
                };
                let _ = writeln!(out, "\t{}\t{}, {}", widen, src_str, scratch);
                let _ = writeln!(out, "\t{}\t{}, {}", cvt, scratch, dst_str);
            } else {
                let _ = writeln!(out, "\t{}\t{}, {}", cvt, src_str, dst_str);
            }
        }
        // Float to integer: truncating conversion.
        (true, false) => {
            let cvt = if src_ty == Type::Real32 {
                "cvttss2si"
            } else {
                "cvttsd2si"
            };
            let _ = writeln!(out, "\t{}\t{}, {}", cvt, src_str, dst_str);
        }
        // Float to float.
        (true, true) => {
            let cvt = if src_ty == Type::Real32 {
                "cvtss2sd"
            } else {
                "cvtsd2ss"
            };
            let _ = writeln!(out, "\t{}\t{}, {}", cvt, src_str, dst_str);
        }
    }
}

fn mov_mnemonic(ty: Type) -> &'static str {
    match ty {
        Type::Real32 => "movss",
        Type::Real64 => "movsd",
        _ => match ty.bytes() {
            1 => "movb",
            2 => "movw",
            4 => "movl",
            _ => "movq",
        },
    }
}

fn extend_mnemonic(src: Type, dst: Type) -> &'static str {
    let signed = src.is_signed_int();
    match (src.bytes(), dst.bytes(), signed) {
        (1, 2, true) => "movsbw",
        (1, 4, true) => "movsbl",
        (1, 8, true) => "movsbq",
        (2, 4, true) => "movswl",
        (2, 8, true) => "movswq",
        (4, 8, true) => "movslq",
        (1, 2, false) => "movzbw",
        (1, 4, false) => "movzbl",
        (1, 8, false) => "movzbq",
        (2, 4, false) => "movzwl",
        (2, 8, false) => "movzwq",
        // Writing the 32-bit register zero-extends for free.
        (4, 8, false) => "movl",
        _ => panic!("no extension from {} to {}", src, dst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cast(src: Type, dst: Type, scratch: Option<&str>) -> String {
        let mut out = String::new();
        emit_cast(&mut out, src, dst, "%src", "%dst", scratch, false);
        out
    }

    #[test]
    fn widenings_pick_signedness() {
        assert!(cast(Type::Int8, Type::Int32, None).contains("movsbl"));
        assert!(cast(Type::Uint8, Type::Int32, None).contains("movzbl"));
        assert!(cast(Type::Int32, Type::Int64, None).contains("movslq"));
        assert!(cast(Type::Uint32, Type::Uint64, None).contains("movl"));
    }

    #[test]
    fn narrow_int_to_float_widens_through_scratch() {
        let s = cast(Type::Int8, Type::Real32, Some("%ecx"));
        assert!(s.contains("movsbl\t%src, %ecx"));
        assert!(s.contains("cvtsi2ss\t%ecx, %dst"));

        let s = cast(Type::Uint16, Type::Real64, Some("%ecx"));
        assert!(s.contains("movzwl"));
        assert!(s.contains("cvtsi2sd"));
    }

    #[test]
    fn wide_int_to_float_is_direct() {
        assert!(cast(Type::Int32, Type::Real32, None).contains("cvtsi2ss\t%src, %dst"));
        assert!(cast(Type::Int64, Type::Real64, None).contains("cvtsi2sd"));
    }

    #[test]
    fn float_conversions() {
        assert!(cast(Type::Real32, Type::Real64, None).contains("cvtss2sd"));
        assert!(cast(Type::Real64, Type::Real32, None).contains("cvtsd2ss"));
        assert!(cast(Type::Real32, Type::Int32, None).contains("cvttss2si"));
        assert!(cast(Type::Real64, Type::Int64, None).contains("cvttsd2si"));
    }

    #[test]
    fn same_color_narrowing_is_free() {
        let mut out = String::new();
        emit_cast(&mut out, Type::Int64, Type::Int8, "%a", "%a", None, true);
        assert!(out.is_empty());
    }
}
