//! CD sector error-correction parity (ECMA-130 P and Q vectors).
//!
//! Verification strips sync and ECC from flagged frames before
//! compression, so decode regenerates them to restore the original 2352
//! byte sector. Arithmetic is GF(2^8) with polynomial 0x11d.

/// Bytes in one raw CD sector.
pub const SECTOR_BYTES: usize = 2352;

const MODE_OFFSET: usize = 15;
const DATA_OFFSET: usize = 12;
const P_OFFSET: usize = 2076;
const P_VECTORS: usize = 86;
const P_COMP: usize = 24;
const Q_OFFSET: usize = 2248;
const Q_VECTORS: usize = 52;
const Q_COMP: usize = 43;
// Q parity covers the header/data area plus the P parity.
const Q_SPAN: usize = P_OFFSET - DATA_OFFSET + 2 * P_VECTORS;

const GF_POLY: u8 = 0x1d;
// Multiplicative inverse of 3 (alpha + 1) under 0x11d.
const GF_INV3: u8 = 0xf4;

fn gf_mul2(x: u8) -> u8 {
    (x << 1) ^ if x & 0x80 != 0 { GF_POLY } else { 0 }
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        a = gf_mul2(a);
        b >>= 1;
    }
    product
}

/// Source byte for parity computation. Mode 2 sectors treat the four
/// header bytes as zero.
fn source_byte(sector: &[u8], offset: usize) -> u8 {
    if sector[MODE_OFFSET] == 2 && offset < 4 {
        0
    } else {
        sector[DATA_OFFSET + offset]
    }
}

/// RS(n, n-2) parity pair over one vector of source offsets.
fn compute_pair(sector: &[u8], offsets: impl Iterator<Item = usize>) -> (u8, u8) {
    let mut weighted = 0u8;
    let mut plain = 0u8;
    for offset in offsets {
        let byte = source_byte(sector, offset);
        weighted = gf_mul2(weighted ^ byte);
        plain ^= byte;
    }
    let p0 = gf_mul(gf_mul2(weighted) ^ plain, GF_INV3);
    (p0, plain ^ p0)
}

fn p_vector(index: usize) -> impl Iterator<Item = usize> {
    (0..P_COMP).map(move |row| P_VECTORS * row + index)
}

fn q_vector(index: usize) -> impl Iterator<Item = usize> {
    let diagonal = index >> 1;
    let plane = index & 1;
    (0..Q_COMP).map(move |step| (86 * diagonal + 88 * step) % Q_SPAN + plane)
}

/// Writes fresh P and Q parity into `sector` in place.
pub fn generate(sector: &mut [u8]) {
    debug_assert_eq!(sector.len(), SECTOR_BYTES);
    for index in 0..P_VECTORS {
        let (p0, p1) = compute_pair(sector, p_vector(index));
        sector[P_OFFSET + index] = p0;
        sector[P_OFFSET + P_VECTORS + index] = p1;
    }
    for index in 0..Q_VECTORS {
        let (q0, q1) = compute_pair(sector, q_vector(index));
        sector[Q_OFFSET + index] = q0;
        sector[Q_OFFSET + Q_VECTORS + index] = q1;
    }
}

/// True when every stored parity byte matches the sector contents.
pub fn verify(sector: &[u8]) -> bool {
    debug_assert_eq!(sector.len(), SECTOR_BYTES);
    for index in 0..P_VECTORS {
        let (p0, p1) = compute_pair(sector, p_vector(index));
        if sector[P_OFFSET + index] != p0 || sector[P_OFFSET + P_VECTORS + index] != p1 {
            return false;
        }
    }
    for index in 0..Q_VECTORS {
        let (q0, q1) = compute_pair(sector, q_vector(index));
        if sector[Q_OFFSET + index] != q0 || sector[Q_OFFSET + Q_VECTORS + index] != q1 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sector() -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_BYTES];
        for (i, byte) in sector.iter_mut().enumerate().take(2064).skip(DATA_OFFSET) {
            *byte = (i * 17 % 256) as u8;
        }
        sector[MODE_OFFSET] = 1;
        sector
    }

    #[test]
    fn inverse_of_three_is_correct() {
        assert_eq!(gf_mul(3, GF_INV3), 1);
    }

    #[test]
    fn parity_pair_satisfies_check_equations() {
        let sector = sample_sector();
        let (p0, p1) = compute_pair(&sector, p_vector(7));
        // plain sum over data plus both parity bytes must cancel
        let mut plain = 0u8;
        for offset in p_vector(7) {
            plain ^= source_byte(&sector, offset);
        }
        assert_eq!(plain ^ p0 ^ p1, 0);
    }

    #[test]
    fn generate_then_verify() {
        let mut sector = sample_sector();
        generate(&mut sector);
        assert!(verify(&sector));
    }

    #[test]
    fn corrupted_data_fails_verification() {
        let mut sector = sample_sector();
        generate(&mut sector);
        sector[100] ^= 0x40;
        assert!(!verify(&sector));
    }

    #[test]
    fn mode2_ignores_header_bytes() {
        let mut sector = sample_sector();
        sector[MODE_OFFSET] = 2;
        generate(&mut sector);
        sector[DATA_OFFSET] ^= 0xff;
        sector[DATA_OFFSET + 1] ^= 0xff;
        // mode stays 2, header bytes are outside the parity source
        assert!(verify(&sector));
    }
}
