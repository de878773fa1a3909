use dotenv::dotenv;

/// Load .env from the working directory; if missing, try the crate root.
pub fn ensure_dotenv() {
    if dotenv().is_ok() {
        return;
    }
    let root = env!("CARGO_MANIFEST_DIR");
    let candidate = format!("{}/.env", root);
    let _ = dotenv::from_filename(candidate);
}
