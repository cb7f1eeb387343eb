//! Double-fork daemonization for the default (non-`-d`) run mode
//! (spec.md §6: `-d` selects "debug/no-fork foreground mode").

#[cfg(unix)]
pub fn daemonize() -> std::io::Result<()> {
    // First fork: detach from the calling shell; the parent exits
    // immediately so `pcm &` returns right away.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }

    // Second fork: prevents the daemon from ever reacquiring a controlling
    // terminal.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    unsafe {
        libc::close(0);
        libc::close(1);
        libc::close(2);
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "daemonizing is only supported on Unix; pass -d to run in the foreground",
    ))
}
