pub const SUBDOMAIN_KEY_LENGTH: usize = 8;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a fresh tunnel key: 8 characters of `[a-z0-9]`, one draw
/// from the OS RNG per position.
pub fn generate_subdomain_key() -> eyre::Result<String> {
    use eyre::WrapErr;
    use rand::RngCore;

    let mut draws = [0u8; 4 * SUBDOMAIN_KEY_LENGTH];
    rand::rngs::OsRng
        .try_fill_bytes(&mut draws)
        .wrap_err_with(|| "os rng unavailable")?;

    Ok(draws
        .chunks_exact(4)
        .map(|c| {
            let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            CHARSET[n as usize % CHARSET.len()] as char
        })
        .collect())
}

/// `http://example.com:8080` + `abc12345` → `http://abc12345.example.com:8080`.
pub fn compose_public_url(base: &str, key: &str) -> eyre::Result<String> {
    match base.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
            Ok(format!("{scheme}://{key}.{rest}"))
        }
        _ => Err(eyre::anyhow!("invalid public URL base: {base}")),
    }
}
