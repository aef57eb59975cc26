use std::io;

/// Send SIGTERM to the process group that `pid` belongs to and return the group id.
#[cfg(unix)]
pub fn terminate_process_group(pid: u32) -> io::Result<i32> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    unsafe {
        let pgid = libc::getpgid(pid);
        if pgid < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::killpg(pgid, libc::SIGTERM) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pgid)
    }
}

#[cfg(not(unix))]
pub fn terminate_process_group(_pid: u32) -> io::Result<i32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signaling requires a unix platform",
    ))
}
