//! 22-character base-62 unique id generation, used for inbox suffixes and
//! mux request tokens. Random-string generation is otherwise named an
//! external collaborator in the spec, but this particular format (fixed
//! alphabet, fixed length) is load-bearing for inbox naming (`_INBOX.<nuid>`)
//! so it lives in-crate rather than behind a callback.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const LEN: usize = 22;

pub fn next() -> String {
    let mut rng = rand::thread_rng();
    (0..LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}
