// Password digest sent to servers in place of the clear secret. This only
// keeps the clear password off the wire and out of server logs; it is not a
// substitute for TLS.

use md5::{Digest, Md5};

/// Lowercase hex MD5 of the secret, the form the login/register endpoints expect.
pub fn hash_secret(secret: &str) -> String {
    let digest = Md5::digest(secret.as_bytes());
    hex::encode(digest)
}
