//! TLS 1.2 pseudo-random function (RFC 5246 section 5).

use crate::suite::MacAlg;
use crate::SecureError;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384};

fn p_hash<M: Mac + Clone>(mac: M, label_seed: &[u8], out: &mut [u8]) {
    // A(1) = HMAC(secret, label || seed)
    let mut a = {
        let mut m = mac.clone();
        m.update(label_seed);
        m.finalize().into_bytes()
    };

    let mut offset = 0;
    while offset < out.len() {
        let mut m = mac.clone();
        m.update(&a);
        m.update(label_seed);
        let block = m.finalize().into_bytes();

        let n = block.len().min(out.len() - offset);
        out[offset..offset + n].copy_from_slice(&block[..n]);
        offset += n;

        let mut m = mac.clone();
        m.update(&a);
        a = m.finalize().into_bytes();
    }
}

/// Fill `out` with PRF(secret, label, seed)
pub fn tls12_prf(
    hash: MacAlg,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out: &mut [u8],
) -> Result<(), SecureError> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    match hash {
        MacAlg::Sha256 => {
            let mac = <Hmac<Sha256> as Mac>::new_from_slice(secret).map_err(|_| SecureError::Crypto)?;
            p_hash(mac, &label_seed, out);
        }
        MacAlg::Sha384 => {
            let mac = <Hmac<Sha384> as Mac>::new_from_slice(secret).map_err(|_| SecureError::Crypto)?;
            p_hash(mac, &label_seed, out);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_prf_sha256_vector() {
        let secret = hex("9bbe436ba940f017b17652849a71db35");
        let seed = hex("a0ba9f936cda311827a6f796ffd5198c");
        let mut out = [0u8; 100];

        tls12_prf(MacAlg::Sha256, &secret, b"test label", &seed, &mut out).unwrap();

        assert_eq!(
            out.to_vec(),
            hex(concat!(
                "e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a",
                "6b301791e90d35c9c9a46b4e14baf9af0fa022f7077def17abfd3797c0564bab",
                "4fbc91666e9def9b97fce34f796789baa48082d122ee42c5a72e5a5110fff701",
                "87347b66"
            ))
        );
    }

    #[test]
    fn test_prf_prefix_stable() {
        let mut short = [0u8; 16];
        let mut long = [0u8; 80];
        tls12_prf(MacAlg::Sha384, b"secret", b"key expansion", b"seed", &mut short).unwrap();
        tls12_prf(MacAlg::Sha384, b"secret", b"key expansion", b"seed", &mut long).unwrap();
        assert_eq!(short[..], long[..16]);
    }
}
