// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page digest computation for signed code.

use crate::{
    embedded_signature::{Digest, DigestType},
    error::SigningError,
};

/// Compute per-page digests over the signed portion of an image.
///
/// `code_limit` is the number of leading bytes covered by the signature. The
/// signature region itself lives past the limit and is never hashed. The
/// final page may be short.
pub fn compute_code_hashes(
    data: &[u8],
    code_limit: usize,
    digest: DigestType,
    page_size_log2: u8,
) -> Result<Vec<Digest<'static>>, SigningError> {
    let signed = data
        .get(..code_limit)
        .ok_or(SigningError::InputTruncated("signed code region"))?;

    let page_size = 1usize << page_size_log2;

    Ok(signed
        .chunks(page_size)
        .map(|page| Digest {
            data: digest.digest_data(page).into(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_counts_around_boundary() {
        for (limit, expected) in [(4095usize, 1usize), (4096, 1), (4097, 2), (0, 0)] {
            let data = vec![0u8; limit + 64];
            let hashes = compute_code_hashes(&data, limit, DigestType::Sha1, 12).unwrap();
            assert_eq!(hashes.len(), expected, "code_limit={}", limit);
        }
    }

    #[test]
    fn digests_cover_only_the_limit() {
        let mut data = vec![0u8; 8192];
        let baseline = compute_code_hashes(&data, 4096, DigestType::Sha1, 12).unwrap();

        // Bytes past the limit must not influence the digests.
        data[5000] = 0xff;
        let modified = compute_code_hashes(&data, 4096, DigestType::Sha1, 12).unwrap();
        assert_eq!(baseline, modified);

        data[100] = 0xff;
        let modified = compute_code_hashes(&data, 4096, DigestType::Sha1, 12).unwrap();
        assert_ne!(baseline, modified);
    }

    #[test]
    fn limit_past_end_is_an_error() {
        assert!(compute_code_hashes(&[0u8; 16], 17, DigestType::Sha1, 12).is_err());
    }

    #[test]
    fn known_sha1_vector() {
        let hashes = compute_code_hashes(b"abc", 3, DigestType::Sha1, 12).unwrap();
        assert_eq!(
            hex::encode(&hashes[0].data),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
