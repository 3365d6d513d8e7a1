// vim: tw=80
//! Parity arithmetic for single and dual-parity stripes
//!
//! P is the XOR of a stripe's data units.  Q is the Reed-Solomon syndrome
//! `Q = Σ g^i · D_i` over GF(2^8) with generator `g = 2`.  Every unit of a
//! stripe, data or check, can be expressed as a linear combination of the
//! others, which is what the DAG builder's compute nodes evaluate.  Mirrors are
//! treated as single-parity stripes with one data unit.

use fixedbitset::FixedBitSet;
use reed_solomon_erasure::galois_8;

use crate::{
    types::*,
    util::xor_into,
};

/// One term of a linear recovery equation: `coeff · unit`
pub type Term = (u32, u8);

/// `g^i`
pub fn gexp(i: u32) -> u8 {
    galois_8::exp(2, i as usize)
}

/// Product of two GF(2^8) elements
pub fn gmul(a: u8, b: u8) -> u8 {
    galois_8::mul(a, b)
}

/// `dst ^= coeff · src`, elementwise in GF(2^8)
pub fn mul_xor_into(coeff: u8, src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), dst.len());
    match coeff {
        0 => (),
        1 => xor_into(dst, src),
        _ => for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d ^= galois_8::mul(coeff, *s);
        }
    }
}

/// An encoder/decoder for a stripe of `nd` data units and `f` check units.
///
/// Units are numbered with data first, then P, then Q.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Codec {
    /// Data units per stripe
    nd: u32,
    /// Check units per stripe: 0, 1, or 2
    f: u32,
}

impl Codec {
    pub fn new(nd: u32, f: u32) -> Self {
        assert!(f <= 2, "Only single and dual parity are supported");
        assert!(nd + f <= 255, "GF(2^8) supports at most 255 units");
        Codec{nd, f}
    }

    /// Coefficient of data unit `data_idx` in check unit `check`
    pub fn coefficient(&self, check: u32, data_idx: u32) -> u8 {
        if check == 0 {
            1
        } else {
            gexp(data_idx)
        }
    }

    /// Generate check units from a complete set of data units.
    ///
    /// `parity` will be overwritten.
    pub fn encode(&self, data: &[&[u8]], parity: &mut [&mut [u8]]) {
        debug_assert_eq!(data.len(), self.nd as usize);
        debug_assert_eq!(parity.len(), self.f as usize);
        for (j, p) in parity.iter_mut().enumerate() {
            p.fill(0);
            for (i, d) in data.iter().enumerate() {
                mul_xor_into(self.coefficient(j as u32, i as u32), d, p);
            }
        }
    }

    /// Fold a change in one data unit into existing check units.
    ///
    /// `delta` is the XOR of the unit's old and new contents.
    pub fn update(&self, data_idx: u32, delta: &[u8], parity: &mut [&mut [u8]])
    {
        for (j, p) in parity.iter_mut().enumerate() {
            mul_xor_into(self.coefficient(j as u32, data_idx), delta, p);
        }
    }

    /// Express unit `target` as a linear combination of surviving units.
    ///
    /// `erased` is the set of unavailable units.  It may include units other
    /// than `target`.  The returned terms reference only units not in
    /// `erased`.  Fails with `ENXIO` when more units are erased than the stripe
    /// can tolerate.
    pub fn recovery_terms(&self, erased: &FixedBitSet, target: u32)
        -> Result<Vec<Term>>
    {
        let width = (self.nd + self.f) as usize;
        if !erased.contains(target as usize) {
            return Ok(vec![(target, 1)]);
        }
        if erased.count_ones(..width) as u32 > self.f {
            return Err(Error::ENXIO);
        }
        let coeffs = if target < self.nd {
            self.recover_data(erased, target)?
        } else {
            // Recompute a check unit from the data, substituting recovered
            // values for any erased data units.
            let check = target - self.nd;
            let mut acc = vec![0u8; width];
            for i in 0..self.nd {
                let c = self.coefficient(check, i);
                if erased.contains(i as usize) {
                    let sub = self.recover_data(erased, i)?;
                    for (a, s) in acc.iter_mut().zip(sub.iter()) {
                        *a ^= galois_8::mul(c, *s);
                    }
                } else {
                    acc[i as usize] ^= c;
                }
            }
            acc
        };
        Ok(coeffs.into_iter()
            .enumerate()
            .filter(|(_, c)| *c != 0)
            .map(|(u, c)| (u as u32, c))
            .collect())
    }

    /// Dense coefficients that recover erased data unit `x`
    fn recover_data(&self, erased: &FixedBitSet, x: u32) -> Result<Vec<u8>> {
        let width = (self.nd + self.f) as usize;
        let p = self.nd;
        let q = self.nd + 1;
        let p_ok = self.f >= 1 && !erased.contains(p as usize);
        let q_ok = self.f >= 2 && !erased.contains(q as usize);
        let lost_data = erased.ones()
            .filter(|u| *u < self.nd as usize)
            .map(|u| u as u32)
            .collect::<Vec<_>>();
        let mut acc = vec![0u8; width];
        match lost_data[..] {
            [_] if p_ok => {
                acc[p as usize] = 1;
                for j in (0..self.nd).filter(|j| *j != x) {
                    acc[j as usize] = 1;
                }
            }
            [_] if q_ok => {
                // D_x = g^-x · (Q + Σ g^j · D_j)
                let inv = galois_8::div(1, gexp(x));
                acc[q as usize] = inv;
                for j in (0..self.nd).filter(|j| *j != x) {
                    acc[j as usize] = galois_8::mul(inv, gexp(j));
                }
            }
            [a, b] if p_ok && q_ok => {
                // With P' and Q' the syndromes of the surviving data,
                // D_x = A · (P + P') + B · (Q + Q'), where
                // A = g^y / (g^x + g^y) and B = 1 / (g^x + g^y)
                let y = if a == x { b } else { a };
                let denom = gexp(x) ^ gexp(y);
                let ca = galois_8::div(gexp(y), denom);
                let cb = galois_8::div(1, denom);
                acc[p as usize] = ca;
                acc[q as usize] = cb;
                for j in (0..self.nd).filter(|j| *j != x && *j != y) {
                    acc[j as usize] = ca ^ galois_8::mul(cb, gexp(j));
                }
            }
            _ => return Err(Error::ENXIO)
        }
        Ok(acc)
    }

    pub fn data_units(&self) -> u32 {
        self.nd
    }

    pub fn protection(&self) -> u32 {
        self.f
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;
    use rstest::rstest;
    use super::*;

    fn random_stripe(rng: &mut XorShiftRng, codec: &Codec, len: usize)
        -> Vec<Vec<u8>>
    {
        let nd = codec.data_units() as usize;
        let f = codec.protection() as usize;
        let data = (0..nd).map(|_| {
            let mut v = vec![0u8; len];
            rng.fill(&mut v[..]);
            v
        }).collect::<Vec<_>>();
        let mut parity = vec![vec![0u8; len]; f];
        {
            let drefs = data.iter().map(|v| &v[..]).collect::<Vec<_>>();
            let mut prefs = parity.iter_mut()
                .map(|v| &mut v[..])
                .collect::<Vec<_>>();
            codec.encode(&drefs, &mut prefs);
        }
        data.into_iter().chain(parity).collect()
    }

    fn evaluate(terms: &[Term], units: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0u8; units[0].len()];
        for (u, c) in terms {
            mul_xor_into(*c, &units[*u as usize], &mut out);
        }
        out
    }

    #[test]
    fn xor_parity() {
        let codec = Codec::new(3, 1);
        let d0 = [0xAAu8; 4];
        let d1 = [0x0Fu8; 4];
        let d2 = [0x01u8; 4];
        let mut p = [0u8; 4];
        codec.encode(&[&d0, &d1, &d2], &mut [&mut p]);
        assert_eq!(p, [0xAA ^ 0x0F ^ 0x01; 4]);
    }

    #[test]
    fn q_syndrome() {
        let codec = Codec::new(2, 2);
        let d0 = [1u8];
        let d1 = [1u8];
        let mut p = [0u8];
        let mut q = [0u8];
        codec.encode(&[&d0, &d1], &mut [&mut p, &mut q]);
        assert_eq!(p, [0]);
        // g^0 + g^1 = 1 ^ 2
        assert_eq!(q, [3]);
    }

    /// Updating parity with a delta matches re-encoding from scratch
    #[test]
    fn update() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let codec = Codec::new(4, 2);
        let mut units = random_stripe(&mut rng, &codec, 64);
        let mut newd = vec![0u8; 64];
        rng.fill(&mut newd[..]);
        let mut delta = units[2].clone();
        xor_into(&mut delta, &newd);
        {
            let (_, parity) = units.split_at_mut(4);
            let mut prefs = parity.iter_mut()
                .map(|v| &mut v[..])
                .collect::<Vec<_>>();
            codec.update(2, &delta, &mut prefs);
        }
        units[2] = newd;
        let mut expected = vec![vec![0u8; 64]; 2];
        {
            let drefs = units[..4].iter().map(|v| &v[..]).collect::<Vec<_>>();
            let mut prefs = expected.iter_mut()
                .map(|v| &mut v[..])
                .collect::<Vec<_>>();
            codec.encode(&drefs, &mut prefs);
        }
        assert_eq!(&units[4..], &expected[..]);
    }

    /// Every unit can be recovered from every tolerable erasure pattern
    #[rstest]
    #[case(1, 1)]
    #[case(4, 1)]
    #[case(2, 2)]
    #[case(5, 2)]
    fn recover_all(#[case] nd: u32, #[case] f: u32) {
        let mut rng = XorShiftRng::seed_from_u64(7);
        let codec = Codec::new(nd, f);
        let width = (nd + f) as usize;
        let units = random_stripe(&mut rng, &codec, 32);
        for a in 0..width {
            for b in a..width {
                if b != a && f < 2 {
                    continue;
                }
                let mut erased = FixedBitSet::with_capacity(width);
                erased.insert(a);
                erased.insert(b);
                for target in erased.ones() {
                    let terms = codec.recovery_terms(&erased, target as u32)
                        .unwrap();
                    assert!(terms.iter().all(|(u, _)|
                        !erased.contains(*u as usize)));
                    assert_eq!(evaluate(&terms, &units), units[target],
                        "target {target} erased {a},{b}");
                }
            }
        }
    }

    #[test]
    fn too_many_erasures() {
        let codec = Codec::new(3, 1);
        let mut erased = FixedBitSet::with_capacity(4);
        erased.insert(0);
        erased.insert(3);
        assert_eq!(codec.recovery_terms(&erased, 0), Err(Error::ENXIO));
    }

    #[test]
    fn not_erased() {
        let codec = Codec::new(3, 1);
        let erased = FixedBitSet::with_capacity(4);
        assert_eq!(codec.recovery_terms(&erased, 2).unwrap(), vec![(2, 1)]);
    }
}
// LCOV_EXCL_STOP
