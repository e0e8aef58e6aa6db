// パス: runtime_native/src/readiness.rs
// 役割: fd の読み書き準備を OS の監視機構で待つ仕組みを提供する
// 意図: スケジューラが fd 由来の再開を epoll / kqueue 経由で学べるようにする
// 関連ファイル: runtime_native/src/sched.rs, runtime_native/tests/runtime.rs
//! 準備通知ファシリティ
//!
//! - Linux では epoll、macOS 系では kqueue を使う。
//! - 自己パイプを常時監視し、他スレッドからの `wake` でブロッキング待機を
//!   破れるようにする（プールスレッドの完了通知用）。
//! - 登録は (fd, 読み/書き, タスク) の 3 つ組。準備ができた fd のタスクを
//!   返し、登録は一度きりで消える（エッジ相当の使い方）。

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::value::PyValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    task: PyValue,
}

struct Watcher {
    poll_fd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    registrations: Vec<Registration>,
}

// fd と登録表は Mutex 越しにしか触らない
unsafe impl Send for Watcher {}

static WATCHER: Lazy<Mutex<Watcher>> = Lazy::new(|| Mutex::new(Watcher::create()));

pub fn init() {
    Lazy::force(&WATCHER);
}

impl Watcher {
    #[cfg(target_os = "linux")]
    fn create() -> Self {
        unsafe {
            let poll_fd = libc::epoll_create1(0);
            let mut pipe_fds = [0 as RawFd; 2];
            libc::pipe(pipe_fds.as_mut_ptr());
            set_nonblocking(pipe_fds[0]);
            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: pipe_fds[0] as u64,
            };
            libc::epoll_ctl(poll_fd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev);
            Self {
                poll_fd,
                wake_read: pipe_fds[0],
                wake_write: pipe_fds[1],
                registrations: Vec::new(),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn create() -> Self {
        unsafe {
            let poll_fd = libc::kqueue();
            let mut pipe_fds = [0 as RawFd; 2];
            libc::pipe(pipe_fds.as_mut_ptr());
            set_nonblocking(pipe_fds[0]);
            let change = libc::kevent {
                ident: pipe_fds[0] as usize,
                filter: libc::EVFILT_READ,
                flags: libc::EV_ADD,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            libc::kevent(poll_fd, &change, 1, std::ptr::null_mut(), 0, std::ptr::null());
            Self {
                poll_fd,
                wake_read: pipe_fds[0],
                wake_write: pipe_fds[1],
                registrations: Vec::new(),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn add_fd(&self, fd: RawFd, interest: Interest) {
        unsafe {
            let events = match interest {
                Interest::Readable => libc::EPOLLIN | libc::EPOLLONESHOT,
                Interest::Writable => libc::EPOLLOUT | libc::EPOLLONESHOT,
            };
            let mut ev = libc::epoll_event {
                events: events as u32,
                u64: fd as u64,
            };
            if libc::epoll_ctl(self.poll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) != 0 {
                libc::epoll_ctl(self.poll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn add_fd(&self, fd: RawFd, interest: Interest) {
        unsafe {
            let filter = match interest {
                Interest::Readable => libc::EVFILT_READ,
                Interest::Writable => libc::EVFILT_WRITE,
            };
            let change = libc::kevent {
                ident: fd as usize,
                filter,
                flags: libc::EV_ADD | libc::EV_ONESHOT,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            libc::kevent(self.poll_fd, &change, 1, std::ptr::null_mut(), 0, std::ptr::null());
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        unsafe {
            while libc::read(self.wake_read, buf.as_mut_ptr() as *mut libc::c_void, 64) > 0 {}
        }
    }
}

#[cfg(target_os = "linux")]
fn poll_ready(poll_fd: RawFd, timeout: Duration) -> Vec<RawFd> {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 16];
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let n = unsafe { libc::epoll_wait(poll_fd, events.as_mut_ptr(), 16, ms) };
    let mut out = Vec::new();
    for ev in events.iter().take(n.max(0) as usize) {
        out.push(ev.u64 as RawFd);
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn poll_ready(poll_fd: RawFd, timeout: Duration) -> Vec<RawFd> {
    let spec = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    let mut events: [libc::kevent; 16] = unsafe { std::mem::zeroed() };
    let n = unsafe {
        libc::kevent(
            poll_fd,
            std::ptr::null(),
            0,
            events.as_mut_ptr(),
            16,
            &spec,
        )
    };
    let mut out = Vec::new();
    for ev in events.iter().take(n.max(0) as usize) {
        out.push(ev.ident as RawFd);
    }
    out
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// fd の準備待ちを登録する。
pub fn register(fd: RawFd, interest: Interest, task: PyValue) {
    let mut watcher = WATCHER.lock().expect("watcher ロックは毒化しない");
    watcher.add_fd(fd, interest);
    watcher.registrations.push(Registration { fd, interest, task });
}

/// 登録済みの fd 待ちがあるかどうか。
pub fn has_waiters() -> bool {
    !WATCHER
        .lock()
        .expect("watcher ロックは毒化しない")
        .registrations
        .is_empty()
}

/// 準備完了か wake まで待つ。準備ができた登録のタスクを返す。
/// ブロッキング待機の間はロックを手放し、他スレッドの wake を妨げない。
pub fn wait(timeout: Duration) -> Vec<PyValue> {
    let poll_fd = WATCHER
        .lock()
        .expect("watcher ロックは毒化しない")
        .poll_fd;
    let ready_fds = poll_ready(poll_fd, timeout);
    let mut watcher = WATCHER.lock().expect("watcher ロックは毒化しない");
    if ready_fds.contains(&watcher.wake_read) {
        watcher.drain_wake_pipe();
    }
    let mut out = Vec::new();
    watcher.registrations.retain(|reg| {
        if ready_fds.contains(&reg.fd) {
            out.push(reg.task);
            false
        } else {
            true
        }
    });
    out
}

/// 他スレッドから待機を破る。
pub fn wake() {
    let watcher = WATCHER.lock().expect("watcher ロックは毒化しない");
    unsafe {
        let byte = 1u8;
        libc::write(
            watcher.wake_write,
            &byte as *const u8 as *const libc::c_void,
            1,
        );
    }
}

// ---- extern 面 ----

/// fd の読み取り準備待ちを登録する。
#[no_mangle]
pub extern "C" fn py_task_wait_fd_readable(task: PyValue, fd: i32) {
    register(fd, Interest::Readable, task);
}

/// fd の書き込み準備待ちを登録する。
#[no_mangle]
pub extern "C" fn py_task_wait_fd_writable(task: PyValue, fd: i32) {
    register(fd, Interest::Writable, task);
}
