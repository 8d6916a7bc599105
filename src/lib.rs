pub mod ca;
pub mod channel;
pub mod config;
pub mod hce;
pub mod kv;
pub mod message;
pub mod parent;
pub mod pfe;
pub mod privsep;
pub mod registry;
pub mod relay;
pub mod rsae;
pub mod secret;

/// Open fds of the current process, for the accept reserve check.
pub fn fd_count() -> std::io::Result<usize> {
    Ok(std::fs::read_dir("/proc/self/fd")?.count())
}
