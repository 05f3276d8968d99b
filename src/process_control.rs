//! Pause, resume and interrupt an OS child process.
//!
//! Unix has real signals. Windows has no process-wide suspend, so the
//! implementation walks the thread list and suspends every thread of
//! the target process, restoring them on resume.

use std::io;

#[cfg(unix)]
mod imp {
    use std::io;

    fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
        // Safety: plain kill(2) on a pid we spawned ourselves.
        let ret = unsafe { libc::kill(pid as libc::pid_t, sig) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn suspend(pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGSTOP)
    }

    pub fn resume(pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGCONT)
    }

    pub fn interrupt(pid: u32) -> io::Result<()> {
        signal(pid, libc::SIGTERM)
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use windows::Win32::System::Threading::{
        OpenThread, ResumeThread, SuspendThread, THREAD_SUSPEND_RESUME,
    };

    fn for_each_thread(pid: u32, f: impl Fn(HANDLE) -> u32) -> io::Result<()> {
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
                .map_err(|e| io::Error::other(e.to_string()))?;
            let mut entry = THREADENTRY32 {
                dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
                ..Default::default()
            };
            let mut ok = Thread32First(snapshot, &mut entry).is_ok();
            while ok {
                if entry.th32OwnerProcessID == pid {
                    if let Ok(thread) = OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID)
                    {
                        f(thread);
                        let _ = CloseHandle(thread);
                    }
                }
                ok = Thread32Next(snapshot, &mut entry).is_ok();
            }
            let _ = CloseHandle(snapshot);
        }
        Ok(())
    }

    pub fn suspend(pid: u32) -> io::Result<()> {
        for_each_thread(pid, |thread| unsafe { SuspendThread(thread) })
    }

    pub fn resume(pid: u32) -> io::Result<()> {
        for_each_thread(pid, |thread| unsafe { ResumeThread(thread) })
    }

    /// No SIGTERM equivalent. Callers fall back to a hard kill after
    /// the grace window, which on Windows is the only option anyway.
    pub fn interrupt(_pid: u32) -> io::Result<()> {
        Err(io::Error::other("graceful interrupt is not supported"))
    }
}

pub fn suspend(pid: u32) -> io::Result<()> {
    imp::suspend(pid)
}

pub fn resume(pid: u32) -> io::Result<()> {
    imp::resume(pid)
}

pub fn interrupt(pid: u32) -> io::Result<()> {
    imp::interrupt(pid)
}
