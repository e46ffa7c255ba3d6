use log::debug;
use std::io;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(windows)]
use winapi::shared::minwindef::{DWORD, FALSE};
#[cfg(windows)]
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
#[cfg(windows)]
use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
#[cfg(windows)]
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Process32First, Process32Next, PROCESSENTRY32, TH32CS_SNAPPROCESS,
};
#[cfg(windows)]
use winapi::um::winnt::PROCESS_TERMINATE;

pub struct ProcessHelper;

impl ProcessHelper {
    /// Forcefully kills the process. On Windows, uses WinAPI TerminateProcess.
    /// On Unix, sends SIGKILL.
    pub fn kill(pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            let pid = Pid::from_raw(pid as i32);
            kill(pid, Signal::SIGKILL).map_err(io::Error::from)?;
            Ok(())
        }
        #[cfg(windows)]
        {
            let handle = unsafe { OpenProcess(PROCESS_TERMINATE, FALSE, pid) };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            let result = unsafe { TerminateProcess(handle, 1) };
            unsafe { CloseHandle(handle) };
            if result == 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    /// Every process below `root`, deepest first, so that killing in order never
    /// orphans a grandchild onto init before it is reached.
    pub fn descendants(root: u32) -> io::Result<Vec<u32>> {
        let table = Self::parent_table()?;
        let mut ordered = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent) = frontier.pop() {
            for &(pid, ppid) in &table {
                if ppid == parent && pid != root && !ordered.contains(&pid) {
                    ordered.push(pid);
                    frontier.push(pid);
                }
            }
        }
        ordered.reverse();
        Ok(ordered)
    }

    /// `(pid, parent pid)` for every visible process.
    #[cfg(unix)]
    fn parent_table() -> io::Result<Vec<(u32, u32)>> {
        use std::fs;
        let mut table = Vec::new();
        for entry in fs::read_dir("/proc")? {
            let entry = entry?;
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            // the process may be gone by now
            let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
                continue;
            };
            if let Some(ppid) = Self::parse_ppid(&stat) {
                table.push((pid, ppid));
            }
        }
        Ok(table)
    }

    #[cfg(windows)]
    fn parent_table() -> io::Result<Vec<(u32, u32)>> {
        let mut table = Vec::new();
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        let mut entry: PROCESSENTRY32 = unsafe { std::mem::zeroed() };
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32>() as DWORD;

        if unsafe { Process32First(snapshot, &mut entry) } != 0 {
            loop {
                table.push((entry.th32ProcessID, entry.th32ParentProcessID));
                if unsafe { Process32Next(snapshot, &mut entry) } == 0 {
                    break;
                }
            }
        }

        unsafe { CloseHandle(snapshot) };
        Ok(table)
    }

    /// The command name in `/proc/<pid>/stat` may itself contain spaces and
    /// parentheses, so fields are counted from the last `)`.
    #[cfg_attr(not(unix), allow(dead_code))]
    fn parse_ppid(stat: &str) -> Option<u32> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let ppid = rest.split_whitespace().nth(1)?.parse().ok();
        if ppid.is_none() {
            debug!("unparsable stat line: {}", stat);
        }
        ppid
    }
}
