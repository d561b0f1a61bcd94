//! Produces bounded sets of mutated candidate values for one original.
//!
//! Three independently switchable strategies contribute to the result:
//! *mutational* perturbs the original in a small numeric neighborhood,
//! *heuristic* supplies fixed boundary values with a high likelihood of
//! tripping missing input checks, and *random* samples the type's legal
//! range. The union of all contributions is returned with duplicates
//! removed; iteration order is unspecified.

use hashbrown::HashSet;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::options::MorpherOptions;
use crate::trace::types::Primitive;
use crate::trace::value::CValue;

/// Characters that often carry special meaning to parsers and paths.
const CHAR_BOUNDARIES: &[u8] = &[
    b'\0', b'\r', b'\n', 0x08, b'\t', b' ', b'@', b'%', b':', b'\\', b'/', b'|', b'=', b',', b';',
    b')', b'(', b'"', b'.', 0xff,
];

/// Candidate value generator, configured once per fuzzing session.
#[derive(Debug)]
pub struct Generator {
    mutational: bool,
    mutate_range: u32,
    heuristic: bool,
    random: bool,
    random_cases: u32,
}

impl Generator {
    /// Reads the strategy switches from the options.
    #[must_use]
    pub fn new(options: &MorpherOptions) -> Self {
        Generator {
            mutational: options.mutational,
            mutate_range: options.mutate_range,
            heuristic: options.heuristic,
            random: options.random,
            random_cases: options.random_cases,
        }
    }

    /// Generates the candidate set for one original value.
    ///
    /// Every candidate lies in the representable range of `prim`. Pointer
    /// originals only receive heuristic values; perturbing a live pointer
    /// in-process is a crash of the engine's own making, not a finding.
    #[must_use]
    pub fn generate(&self, prim: Primitive, orig: &CValue) -> Vec<CValue> {
        let mut values = HashSet::new();
        match prim {
            Primitive::Char => self.chars(orig, &mut values),
            Primitive::Float | Primitive::Double => self.floats(prim, orig, &mut values),
            Primitive::Pointer => self.pointers(&mut values),
            _ => self.integers(prim, orig, &mut values),
        }
        values.into_iter().collect()
    }

    fn chars(&self, orig: &CValue, values: &mut HashSet<CValue>) {
        let orig = match orig {
            CValue::Char(b) => *b,
            _ => return,
        };
        if self.mutational {
            if orig.is_ascii_digit() {
                values.insert(CValue::Char(b'a'));
                values.insert(CValue::Char(b'Z'));
            } else {
                values.insert(CValue::Char(b'0'));
                values.insert(CValue::Char(b'9'));
                values.insert(CValue::Char(swap_case(orig)));
            }
        }
        if self.heuristic {
            for &b in CHAR_BOUNDARIES {
                values.insert(CValue::Char(b));
            }
        }
        if self.random {
            let mut rng = SmallRng::from_entropy();
            for _ in 0..self.random_cases {
                values.insert(CValue::Char(rng.gen_range(0..=127u8)));
            }
        }
    }

    fn integers(&self, prim: Primitive, orig: &CValue, values: &mut HashSet<CValue>) {
        let Some((min, max)) = int_bounds(prim) else {
            return;
        };
        let orig = match int_value(orig) {
            Some(v) => v,
            None => return,
        };
        let signed = min < 0;
        let mut keep = |v: i128, values: &mut HashSet<CValue>| {
            if v >= min && v <= max {
                values.insert(int_cvalue(prim, v));
            }
        };
        if self.mutational {
            for k in 1..=i128::from(self.mutate_range) {
                keep(orig + k, values);
                keep(orig - k, values);
            }
            if signed {
                keep(-orig, values);
            }
            for e in [orig / 2, orig / 4, orig * 2, orig * 4] {
                keep(e, values);
                if signed {
                    keep(-e, values);
                }
            }
        }
        if self.heuristic {
            for base in [min, max, 0, min / 2, min / 4, max / 2, max / 4] {
                for x in 0..5 {
                    keep(base + x, values);
                    keep(base - x, values);
                }
            }
        }
        if self.random {
            let mut rng = SmallRng::from_entropy();
            for _ in 0..self.random_cases {
                keep(rng.gen_range(min..=max), values);
            }
        }
    }

    fn floats(&self, prim: Primitive, orig: &CValue, values: &mut HashSet<CValue>) {
        let orig = match orig {
            CValue::Float(v) => f64::from(*v),
            CValue::Double(v) => *v,
            _ => return,
        };
        let single = prim == Primitive::Float;
        let mut keep = |v: f64, values: &mut HashSet<CValue>| {
            if single {
                let narrowed = v as f32;
                if narrowed.is_finite() {
                    values.insert(CValue::Float(narrowed));
                }
            } else if v.is_finite() {
                values.insert(CValue::Double(v));
            }
        };
        let mut keep_special = |v: f64, values: &mut HashSet<CValue>| {
            if single {
                values.insert(CValue::Float(v as f32));
            } else {
                values.insert(CValue::Double(v));
            }
        };
        if self.mutational {
            for k in 1..=i128::from(self.mutate_range) {
                keep(orig + k as f64, values);
                keep(orig - k as f64, values);
            }
            for e in [
                orig / 2.0,
                orig / 3.0,
                orig / 4.0,
                orig * 2.0,
                orig * 3.0,
                orig * 4.0,
            ] {
                keep(e, values);
                keep(-e, values);
            }
        }
        if self.heuristic {
            let max = if single { f64::from(f32::MAX) } else { f64::MAX };
            let min = if single {
                f64::from(f32::MIN_POSITIVE)
            } else {
                f64::MIN_POSITIVE
            };
            keep_special(f64::NAN, values);
            keep_special(f64::INFINITY, values);
            keep_special(f64::NEG_INFINITY, values);
            keep_special(0.0, values);
            keep_special(-0.0, values);
            for v in [max, min] {
                keep_special(v, values);
                keep_special(-v, values);
            }
            for k in [2.0, 3.0, 4.0] {
                keep_special(max / k, values);
                keep_special(-(max / k), values);
                keep_special(min * k, values);
                keep_special(-(min * k), values);
            }
        }
        if self.random {
            let mut rng = SmallRng::from_entropy();
            let max = if single { f64::from(f32::MAX) } else { f64::MAX };
            for _ in 0..self.random_cases {
                let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
                keep(rng.gen::<f64>() * max * sign, values);
            }
        }
    }

    fn pointers(&self, values: &mut HashSet<CValue>) {
        // Null, -1, and a value past the user/kernel boundary of the
        // original target platform: all pass naive null checks and fault
        // on the first dereference.
        if self.heuristic {
            values.insert(CValue::Ptr(0));
            values.insert(CValue::Ptr(usize::MAX));
            values.insert(CValue::Ptr(0x8000_0000));
        }
    }
}

fn swap_case(b: u8) -> u8 {
    if b.is_ascii_uppercase() {
        b.to_ascii_lowercase()
    } else if b.is_ascii_lowercase() {
        b.to_ascii_uppercase()
    } else {
        b
    }
}

/// Representable range of an integer primitive.
fn int_bounds(prim: Primitive) -> Option<(i128, i128)> {
    let bits = (prim.size() * 8) as u32;
    let signed = matches!(
        prim,
        Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Long | Primitive::Int64
    );
    match prim {
        Primitive::Char | Primitive::Float | Primitive::Double | Primitive::Pointer => None,
        _ if signed => Some((-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)),
        _ => Some((0, (1i128 << bits) - 1)),
    }
}

fn int_value(value: &CValue) -> Option<i128> {
    Some(match value {
        CValue::Int8(v) => i128::from(*v),
        CValue::UInt8(v) => i128::from(*v),
        CValue::Int16(v) => i128::from(*v),
        CValue::UInt16(v) => i128::from(*v),
        CValue::Int32(v) => i128::from(*v),
        CValue::UInt32(v) => i128::from(*v),
        CValue::Long(v) => i128::from(*v),
        CValue::ULong(v) => i128::from(*v),
        CValue::Int64(v) => i128::from(*v),
        CValue::UInt64(v) => i128::from(*v),
        _ => return None,
    })
}

/// Wraps an in-range integer back into the primitive's value type.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn int_cvalue(prim: Primitive, v: i128) -> CValue {
    match prim {
        Primitive::Int8 => CValue::Int8(v as i8),
        Primitive::UInt8 => CValue::UInt8(v as u8),
        Primitive::Int16 => CValue::Int16(v as i16),
        Primitive::UInt16 => CValue::UInt16(v as u16),
        Primitive::Int32 => CValue::Int32(v as i32),
        Primitive::UInt32 => CValue::UInt32(v as u32),
        Primitive::Long => CValue::Long(v as _),
        Primitive::ULong => CValue::ULong(v as _),
        Primitive::Int64 => CValue::Int64(v as i64),
        Primitive::UInt64 => CValue::UInt64(v as u64),
        _ => unreachable!("not an integer primitive"),
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;

    use super::Generator;
    use crate::options::MorpherOptions;
    use crate::trace::types::Primitive;
    use crate::trace::value::CValue;

    fn generator(mutational: bool, heuristic: bool, mutate_range: u32) -> Generator {
        let options = MorpherOptions {
            mutational,
            heuristic,
            random: false,
            mutate_range,
            ..MorpherOptions::default()
        };
        Generator::new(&options)
    }

    fn uints(values: &[CValue]) -> HashSet<u32> {
        values
            .iter()
            .map(|v| match v {
                CValue::UInt32(v) => *v,
                other => panic!("unexpected candidate {other:?}"),
            })
            .collect()
    }

    #[test]
    fn unsigned_mutational_neighborhood() {
        let gen = generator(true, false, 3);
        let candidates = gen.generate(Primitive::UInt32, &CValue::UInt32(100));
        let got = uints(&candidates);
        for expected in [97, 98, 99, 101, 102, 103, 50, 25, 200, 400] {
            assert!(got.contains(&expected), "missing {expected}");
        }
        // No negatives could have survived the unsigned clamp; the variant
        // itself already guarantees the upper bound.
        assert!(got.iter().all(|v| *v <= u32::MAX));
    }

    #[test]
    fn signed_mutational_includes_negations() {
        let gen = generator(true, false, 1);
        let candidates = gen.generate(Primitive::Int32, &CValue::Int32(6));
        let got: HashSet<i32> = candidates
            .iter()
            .map(|v| match v {
                CValue::Int32(v) => *v,
                other => panic!("unexpected candidate {other:?}"),
            })
            .collect();
        for expected in [5, 7, -6, 3, -3, 1, -1, 12, -12, 24, -24] {
            assert!(got.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn heuristic_integers_hit_the_boundaries() {
        let gen = generator(false, true, 0);
        let candidates = gen.generate(Primitive::Int8, &CValue::Int8(0));
        let got: HashSet<i8> = candidates
            .iter()
            .map(|v| match v {
                CValue::Int8(v) => *v,
                other => panic!("unexpected candidate {other:?}"),
            })
            .collect();
        for expected in [-128, 127, 0, -64, 63, -32, 31, -124, 123] {
            assert!(got.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn heuristic_floats_include_specials() {
        let gen = generator(false, true, 0);
        let candidates = gen.generate(Primitive::Double, &CValue::Double(1.5));
        assert!(candidates.contains(&CValue::Double(f64::NAN)));
        assert!(candidates.contains(&CValue::Double(f64::INFINITY)));
        assert!(candidates.contains(&CValue::Double(f64::NEG_INFINITY)));
        assert!(candidates.contains(&CValue::Double(0.0)));
        assert!(candidates.contains(&CValue::Double(-0.0)));
        assert!(candidates.contains(&CValue::Double(f64::MAX)));
    }

    #[test]
    fn pointer_candidates_are_heuristic_only() {
        let gen = generator(true, true, 5);
        let candidates = gen.generate(Primitive::Pointer, &CValue::Ptr(0x1234));
        let got: HashSet<usize> = candidates
            .iter()
            .map(|v| match v {
                CValue::Ptr(v) => *v,
                other => panic!("unexpected candidate {other:?}"),
            })
            .collect();
        assert_eq!(
            got,
            HashSet::from_iter([0usize, usize::MAX, 0x8000_0000])
        );
    }

    #[test]
    fn char_candidates_swap_case_and_class() {
        let gen = generator(true, false, 0);
        let candidates = gen.generate(Primitive::Char, &CValue::Char(b'x'));
        assert!(candidates.contains(&CValue::Char(b'0')));
        assert!(candidates.contains(&CValue::Char(b'9')));
        assert!(candidates.contains(&CValue::Char(b'X')));

        let digit = gen.generate(Primitive::Char, &CValue::Char(b'7'));
        assert!(digit.contains(&CValue::Char(b'a')));
        assert!(digit.contains(&CValue::Char(b'Z')));
    }

    #[test]
    fn generation_is_pure_without_random() {
        let gen = generator(true, true, 4);
        let a: HashSet<CValue> = gen
            .generate(Primitive::Int16, &CValue::Int16(-321))
            .into_iter()
            .collect();
        let b: HashSet<CValue> = gen
            .generate(Primitive::Int16, &CValue::Int16(-321))
            .into_iter()
            .collect();
        assert_eq!(a, b);
    }
}
