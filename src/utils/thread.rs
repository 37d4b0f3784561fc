#![allow(unused)]

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char).
// Names are limited to 16 bytes, including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is zero-initialized, so writing at most
    // MAX_PTHREAD_NAME_LEN - 1 bytes keeps it null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for i in 0..len_to_copy {
        c_name_buf[i] = bytes[i] as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}
