pub struct PasswdEntry {
    pub name: String,
    pub uid: nix::unistd::Uid,
    pub gid: nix::unistd::Gid,
    pub home: std::path::PathBuf,
    pub shell: std::path::PathBuf,
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn make_passwd_from_libc(username: &str, pw: &libc::passwd) -> Result<PasswdEntry, String> {
    let uid = nix::unistd::Uid::from_raw(pw.pw_uid);
    let gid = nix::unistd::Gid::from_raw(pw.pw_gid);
    let home = cstr_to_pathbuf(pw.pw_dir);
    let shell = cstr_to_pathbuf(pw.pw_shell);
    Ok(PasswdEntry {
        name: username.to_string(),
        uid,
        gid,
        home,
        shell,
    })
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn cstr_to_pathbuf(ptr: *mut libc::c_char) -> std::path::PathBuf {
    if ptr.is_null() {
        return std::path::PathBuf::new();
    }
    let mut vec = Vec::new();
    let mut cur = ptr;
    loop {
        let byte = unsafe { *cur } as u8;
        if byte == b'\0' {
            break;
        }
        vec.push(byte);
        unsafe { cur = cur.add(1) };
    }
    std::path::PathBuf::from(std::ffi::OsString::from(unsafe {
        String::from_utf8_unchecked(vec)
    }))
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub fn getpwnam_r(username: &str) -> Result<PasswdEntry, String> {
    let username_i8 = username.bytes().map(|x| x as i8).collect::<Vec<_>>();
    let pointer: *const i8 = username_i8.as_ptr();
    let mut buf_size = 64;
    let mut pw: libc::passwd = unsafe { std::mem::zeroed() };

    let pw_ptr = &mut pw;
    let pw_ptr_ptr = &mut std::ptr::from_mut::<libc::passwd>(pw_ptr);
    loop {
        let mut buf = vec![0; buf_size];

        let errno = unsafe {
            libc::getpwnam_r(pointer, pw_ptr, buf.as_mut_ptr(), buf_size, pw_ptr_ptr)
        };

        if pw_ptr_ptr.is_null() {
            if errno == libc::ERANGE {
                buf_size *= 2;
            } else if errno == 0 {
                return Err(format!("No entry found for username: {username}"));
            } else {
                return Err(format!("Error calling getpwnam_r: {errno}"));
            }
        } else {
            return make_passwd_from_libc(username, &*pw_ptr);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub fn getpwuid_r(uid: nix::unistd::Uid) -> Result<PasswdEntry, String> {
    let mut buf_size = 64;
    let mut pw: libc::passwd = unsafe { std::mem::zeroed() };

    let pw_ptr = &mut pw;
    let pw_ptr_ptr = &mut std::ptr::from_mut::<libc::passwd>(pw_ptr);
    loop {
        let mut buf = vec![0; buf_size];

        let errno = unsafe {
            libc::getpwuid_r(uid.as_raw(), pw_ptr, buf.as_mut_ptr(), buf_size, pw_ptr_ptr)
        };

        if pw_ptr_ptr.is_null() {
            if errno == libc::ERANGE {
                buf_size *= 2;
            } else if errno == 0 {
                return Err(format!("No passwd entry found for uid: {uid}"));
            } else {
                return Err(format!("Error calling getpwuid_r: {errno}"));
            }
        } else {
            let name = cstr_owner_name(pw_ptr.pw_name);
            return make_passwd_from_libc(&name, &*pw_ptr);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn cstr_owner_name(ptr: *mut libc::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    cstr.to_string_lossy().into_owned()
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
compile_error!("pwnam is not yet implemented for this platform");
