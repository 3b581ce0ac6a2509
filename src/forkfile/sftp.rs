//! Minimal SFTP (version 3) server, synchronous, one instance per accepted
//! connection. Runs inside the container's filesystem view, so every path a
//! client sends is resolved by the kernel against the joined namespace or
//! chroot.

use log::debug;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

pub const SFTP_VERSION: u32 = 3;

// Request packet types.
const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_OPEN: u8 = 3;
const SSH_FXP_CLOSE: u8 = 4;
const SSH_FXP_READ: u8 = 5;
const SSH_FXP_WRITE: u8 = 6;
const SSH_FXP_LSTAT: u8 = 7;
const SSH_FXP_FSTAT: u8 = 8;
const SSH_FXP_SETSTAT: u8 = 9;
const SSH_FXP_FSETSTAT: u8 = 10;
const SSH_FXP_OPENDIR: u8 = 11;
const SSH_FXP_READDIR: u8 = 12;
const SSH_FXP_REMOVE: u8 = 13;
const SSH_FXP_MKDIR: u8 = 14;
const SSH_FXP_RMDIR: u8 = 15;
const SSH_FXP_REALPATH: u8 = 16;
const SSH_FXP_STAT: u8 = 17;
const SSH_FXP_RENAME: u8 = 18;
const SSH_FXP_READLINK: u8 = 19;
const SSH_FXP_SYMLINK: u8 = 20;

// Response packet types.
const SSH_FXP_STATUS: u8 = 101;
const SSH_FXP_HANDLE: u8 = 102;
const SSH_FXP_DATA: u8 = 103;
const SSH_FXP_NAME: u8 = 104;
const SSH_FXP_ATTRS: u8 = 105;

// Status codes.
const SSH_FX_OK: u32 = 0;
const SSH_FX_EOF: u32 = 1;
const SSH_FX_NO_SUCH_FILE: u32 = 2;
const SSH_FX_PERMISSION_DENIED: u32 = 3;
const SSH_FX_FAILURE: u32 = 4;
const SSH_FX_BAD_MESSAGE: u32 = 5;
const SSH_FX_OP_UNSUPPORTED: u32 = 8;

// Attribute flags.
const SSH_FILEXFER_ATTR_SIZE: u32 = 0x1;
const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x2;
const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x4;
const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x8;

// Open pflags.
const SSH_FXF_READ: u32 = 0x1;
const SSH_FXF_WRITE: u32 = 0x2;
const SSH_FXF_APPEND: u32 = 0x4;
const SSH_FXF_CREAT: u32 = 0x8;
const SSH_FXF_TRUNC: u32 = 0x10;
const SSH_FXF_EXCL: u32 = 0x20;

const MAX_PACKET: u32 = 4 * 1024 * 1024;
const READDIR_BATCH: usize = 64;

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    fn bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.u32()? as usize;
        let data = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(data.to_vec())
    }

    fn string(&mut self) -> Option<String> {
        String::from_utf8(self.bytes()?).ok()
    }

    /// Reads and discards an attrs block (used by OPEN/SETSTAT paths where
    /// only some fields matter to us).
    fn attrs(&mut self) -> Option<FileAttrs> {
        let flags = self.u32()?;
        let mut attrs = FileAttrs::default();
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(self.u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid = Some(self.u32()?);
            attrs.gid = Some(self.u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(self.u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(self.u32()?);
            attrs.mtime = Some(self.u32()?);
        }
        Some(attrs)
    }
}

#[derive(Default, Debug, Clone, Copy)]
struct FileAttrs {
    size:        Option<u64>,
    uid:         Option<u32>,
    gid:         Option<u32>,
    permissions: Option<u32>,
    atime:       Option<u32>,
    mtime:       Option<u32>,
}

impl FileAttrs {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        Self {
            size: Some(meta.len()),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            permissions: Some(meta.mode()),
            atime: Some(meta.atime() as u32),
            mtime: Some(meta.mtime() as u32),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        out.extend_from_slice(&flags.to_be_bytes());
        if let Some(size) = self.size {
            out.extend_from_slice(&size.to_be_bytes());
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            out.extend_from_slice(&uid.to_be_bytes());
            out.extend_from_slice(&gid.to_be_bytes());
        }
        if let Some(perms) = self.permissions {
            out.extend_from_slice(&perms.to_be_bytes());
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            out.extend_from_slice(&atime.to_be_bytes());
            out.extend_from_slice(&mtime.to_be_bytes());
        }
    }
}

enum Handle {
    File(File),
    Dir {
        entries: Vec<(String, std::fs::Metadata)>,
        pos:     usize,
    },
}

struct Response {
    kind:    u8,
    payload: Vec<u8>,
}

impl Response {
    fn status(id: u32, code: u32, message: &str) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        put_string(&mut payload, message.as_bytes());
        put_string(&mut payload, b"en");
        Self {
            kind: SSH_FXP_STATUS,
            payload,
        }
    }

    fn ok(id: u32) -> Self {
        Self::status(id, SSH_FX_OK, "Success")
    }

    fn io_error(id: u32, err: &std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => SSH_FX_NO_SUCH_FILE,
            std::io::ErrorKind::PermissionDenied => SSH_FX_PERMISSION_DENIED,
            _ => SSH_FX_FAILURE,
        };
        Self::status(id, code, &err.to_string())
    }

    fn handle(id: u32, handle: u32) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        put_string(&mut payload, handle.to_string().as_bytes());
        Self {
            kind: SSH_FXP_HANDLE,
            payload,
        }
    }

    fn data(id: u32, data: &[u8]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        put_string(&mut payload, data);
        Self {
            kind: SSH_FXP_DATA,
            payload,
        }
    }

    fn attrs(id: u32, attrs: &FileAttrs) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        attrs.encode(&mut payload);
        Self {
            kind: SSH_FXP_ATTRS,
            payload,
        }
    }

    fn name(id: u32, entries: &[(String, FileAttrs)]) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (name, attrs) in entries {
            put_string(&mut payload, name.as_bytes());
            put_string(&mut payload, name.as_bytes()); // longname
            attrs.encode(&mut payload);
        }
        Self {
            kind: SSH_FXP_NAME,
            payload,
        }
    }
}

fn put_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

/// Lexically cleans a path into an absolute one; REALPATH must answer even
/// for paths that do not exist yet.
fn clean_path(path: &str) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Per-connection SFTP server state.
pub struct SftpSession {
    handles:     HashMap<u32, Handle>,
    next_handle: u32,
    initialized: bool,
}

impl SftpSession {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            next_handle: 1,
            initialized: false,
        }
    }

    /// Serves one connection until EOF. Returns the number of requests
    /// handled, which feeds the idle watchdog's transaction counter.
    pub fn serve<S: Read + Write>(&mut self, stream: &mut S) -> std::io::Result<u64> {
        let mut handled = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            match read_exact_or_eof(stream, &mut len_buf)? {
                false => return Ok(handled),
                true => {}
            }
            let len = u32::from_be_bytes(len_buf);
            if len == 0 || len > MAX_PACKET {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "sftp packet length out of bounds",
                ));
            }
            let mut packet = vec![0u8; len as usize];
            stream.read_exact(&mut packet)?;

            handled += 1;
            let response = self.dispatch(&packet);
            let mut out = Vec::with_capacity(response.payload.len() + 5);
            out.extend_from_slice(&((response.payload.len() as u32) + 1).to_be_bytes());
            out.push(response.kind);
            out.extend_from_slice(&response.payload);
            stream.write_all(&out)?;
            stream.flush()?;
        }
    }

    fn dispatch(&mut self, packet: &[u8]) -> Response {
        let mut dec = Decoder::new(packet);
        let Some(kind) = dec.u8() else {
            return Response::status(0, SSH_FX_BAD_MESSAGE, "Empty packet");
        };

        if kind == SSH_FXP_INIT {
            self.initialized = true;
            let mut payload = Vec::new();
            payload.extend_from_slice(&SFTP_VERSION.to_be_bytes());
            return Response {
                kind: SSH_FXP_VERSION,
                payload,
            };
        }

        let Some(id) = dec.u32() else {
            return Response::status(0, SSH_FX_BAD_MESSAGE, "Missing request id");
        };
        if !self.initialized {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "INIT not sent");
        }

        match kind {
            SSH_FXP_REALPATH => self.realpath(id, dec),
            SSH_FXP_OPEN => self.open(id, dec),
            SSH_FXP_CLOSE => self.close(id, dec),
            SSH_FXP_READ => self.read(id, dec),
            SSH_FXP_WRITE => self.write(id, dec),
            SSH_FXP_LSTAT => self.stat(id, dec, false),
            SSH_FXP_STAT => self.stat(id, dec, true),
            SSH_FXP_FSTAT => self.fstat(id, dec),
            SSH_FXP_SETSTAT => self.setstat(id, dec),
            SSH_FXP_FSETSTAT => self.fsetstat(id, dec),
            SSH_FXP_OPENDIR => self.opendir(id, dec),
            SSH_FXP_READDIR => self.readdir(id, dec),
            SSH_FXP_REMOVE => self.remove(id, dec),
            SSH_FXP_MKDIR => self.mkdir(id, dec),
            SSH_FXP_RMDIR => self.rmdir(id, dec),
            SSH_FXP_RENAME => self.rename(id, dec),
            SSH_FXP_READLINK => self.readlink(id, dec),
            SSH_FXP_SYMLINK => self.symlink(id, dec),
            other => {
                debug!("Unsupported sftp packet type {}", other);
                Response::status(id, SSH_FX_OP_UNSUPPORTED, "Unsupported operation")
            }
        }
    }

    fn take_handle(&mut self, dec: &mut Decoder<'_>) -> Option<u32> {
        let raw = dec.string()?;
        raw.parse::<u32>().ok()
    }

    fn realpath(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(path) = dec.string() else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Missing path");
        };
        let cleaned = clean_path(&path);
        let attrs = std::fs::metadata(&cleaned)
            .map(|m| FileAttrs::from_metadata(&m))
            .unwrap_or_default();
        Response::name(id, &[(cleaned.to_string_lossy().into_owned(), attrs)])
    }

    fn open(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(path), Some(pflags), Some(attrs)) = (dec.string(), dec.u32(), dec.attrs())
        else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed OPEN");
        };

        let mut options = OpenOptions::new();
        options.read(pflags & SSH_FXF_READ != 0);
        options.write(pflags & SSH_FXF_WRITE != 0);
        options.append(pflags & SSH_FXF_APPEND != 0);
        if pflags & SSH_FXF_CREAT != 0 {
            if pflags & SSH_FXF_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        if pflags & SSH_FXF_TRUNC != 0 {
            options.truncate(true);
        }
        if let Some(mode) = attrs.permissions {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode & 0o7777);
        }

        match options.open(&path) {
            Ok(file) => {
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, Handle::File(file));
                Response::handle(id, handle)
            }
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn close(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        match self.take_handle(&mut dec) {
            Some(handle) if self.handles.remove(&handle).is_some() => Response::ok(id),
            _ => Response::status(id, SSH_FX_BAD_MESSAGE, "Unknown handle"),
        }
    }

    fn read(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(handle), Some(offset), Some(len)) =
            (self.take_handle(&mut dec), dec.u64(), dec.u32())
        else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed READ");
        };
        let Some(Handle::File(file)) = self.handles.get(&handle) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Unknown handle");
        };

        let len = len.min(MAX_PACKET - 1024) as usize;
        let mut buf = vec![0u8; len];
        match file.read_at(&mut buf, offset) {
            Ok(0) => Response::status(id, SSH_FX_EOF, "End of file"),
            Ok(n) => {
                buf.truncate(n);
                Response::data(id, &buf)
            }
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn write(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(handle), Some(offset), Some(data)) =
            (self.take_handle(&mut dec), dec.u64(), dec.bytes())
        else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed WRITE");
        };
        let Some(Handle::File(file)) = self.handles.get(&handle) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Unknown handle");
        };

        match file.write_all_at(&data, offset) {
            Ok(()) => Response::ok(id),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn stat(&mut self, id: u32, mut dec: Decoder<'_>, follow: bool) -> Response {
        let Some(path) = dec.string() else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Missing path");
        };
        let meta = if follow {
            std::fs::metadata(&path)
        } else {
            std::fs::symlink_metadata(&path)
        };
        match meta {
            Ok(meta) => Response::attrs(id, &FileAttrs::from_metadata(&meta)),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn fstat(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(handle) = self.take_handle(&mut dec) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed FSTAT");
        };
        match self.handles.get(&handle) {
            Some(Handle::File(file)) => match file.metadata() {
                Ok(meta) => Response::attrs(id, &FileAttrs::from_metadata(&meta)),
                Err(err) => Response::io_error(id, &err),
            },
            _ => Response::status(id, SSH_FX_BAD_MESSAGE, "Unknown handle"),
        }
    }

    fn apply_attrs(path: Option<&str>, file: Option<&File>, attrs: &FileAttrs) -> std::io::Result<()> {
        if let Some(mode) = attrs.permissions {
            let perms = std::fs::Permissions::from_mode(mode & 0o7777);
            match (path, file) {
                (Some(path), _) => std::fs::set_permissions(path, perms)?,
                (None, Some(file)) => file.set_permissions(perms)?,
                _ => {}
            }
        }
        if let Some(size) = attrs.size {
            match (path, file) {
                (Some(path), _) => OpenOptions::new().write(true).open(path)?.set_len(size)?,
                (None, Some(file)) => file.set_len(size)?,
                _ => {}
            }
        }
        if let (Some(uid), Some(gid), Some(path)) = (attrs.uid, attrs.gid, path) {
            std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        }
        // atime/mtime updates are accepted and ignored.
        Ok(())
    }

    fn setstat(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(path), Some(attrs)) = (dec.string(), dec.attrs()) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed SETSTAT");
        };
        match Self::apply_attrs(Some(&path), None, &attrs) {
            Ok(()) => Response::ok(id),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn fsetstat(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(handle), Some(attrs)) = (self.take_handle(&mut dec), dec.attrs()) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed FSETSTAT");
        };
        match self.handles.get(&handle) {
            Some(Handle::File(file)) => match Self::apply_attrs(None, Some(file), &attrs) {
                Ok(()) => Response::ok(id),
                Err(err) => Response::io_error(id, &err),
            },
            _ => Response::status(id, SSH_FX_BAD_MESSAGE, "Unknown handle"),
        }
    }

    fn opendir(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(path) = dec.string() else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Missing path");
        };
        let mut entries = Vec::new();
        let listing = match std::fs::read_dir(&path) {
            Ok(listing) => listing,
            Err(err) => return Response::io_error(id, &err),
        };
        for entry in listing {
            let Ok(entry) = entry else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            entries.push((entry.file_name().to_string_lossy().into_owned(), meta));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, Handle::Dir { entries, pos: 0 });
        Response::handle(id, handle)
    }

    fn readdir(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(handle) = self.take_handle(&mut dec) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed READDIR");
        };
        let Some(Handle::Dir { entries, pos }) = self.handles.get_mut(&handle) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Unknown handle");
        };

        if *pos >= entries.len() {
            return Response::status(id, SSH_FX_EOF, "End of directory");
        }
        let batch: Vec<(String, FileAttrs)> = entries[*pos..]
            .iter()
            .take(READDIR_BATCH)
            .map(|(name, meta)| (name.clone(), FileAttrs::from_metadata(meta)))
            .collect();
        *pos += batch.len();
        Response::name(id, &batch)
    }

    fn remove(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(path) = dec.string() else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Missing path");
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Response::ok(id),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn mkdir(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(path), Some(attrs)) = (dec.string(), dec.attrs()) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed MKDIR");
        };
        if let Err(err) = std::fs::create_dir(&path) {
            return Response::io_error(id, &err);
        }
        if let Some(mode) = attrs.permissions {
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777));
        }
        Response::ok(id)
    }

    fn rmdir(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(path) = dec.string() else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Missing path");
        };
        match std::fs::remove_dir(&path) {
            Ok(()) => Response::ok(id),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn rename(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let (Some(from), Some(to)) = (dec.string(), dec.string()) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed RENAME");
        };
        match std::fs::rename(&from, &to) {
            Ok(()) => Response::ok(id),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn readlink(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        let Some(path) = dec.string() else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Missing path");
        };
        match std::fs::read_link(&path) {
            Ok(target) => Response::name(
                id,
                &[(target.to_string_lossy().into_owned(), FileAttrs::default())],
            ),
            Err(err) => Response::io_error(id, &err),
        }
    }

    fn symlink(&mut self, id: u32, mut dec: Decoder<'_>) -> Response {
        // Draft order: linkpath first, then targetpath.
        let (Some(linkpath), Some(targetpath)) = (dec.string(), dec.string()) else {
            return Response::status(id, SSH_FX_BAD_MESSAGE, "Malformed SYMLINK");
        };
        match std::os::unix::fs::symlink(&targetpath, &linkpath) {
            Ok(()) => Response::ok(id),
            Err(err) => Response::io_error(id, &err),
        }
    }
}

/// Reads exactly `buf.len()` bytes; a clean EOF before the first byte yields
/// `Ok(false)`.
fn read_exact_or_eof<S: Read>(stream: &mut S, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(false),
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated sftp packet",
                ))
            }
            n => read += n,
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    struct Client {
        stream:  UnixStream,
        next_id: u32,
    }

    impl Client {
        fn send(&mut self, kind: u8, body: &[u8]) {
            let mut packet = Vec::new();
            packet.extend_from_slice(&((body.len() as u32) + 1).to_be_bytes());
            packet.push(kind);
            packet.extend_from_slice(body);
            self.stream.write_all(&packet).unwrap();
        }

        fn request(&mut self, kind: u8, body_fn: impl FnOnce(&mut Vec<u8>)) -> (u8, Vec<u8>) {
            let id = self.next_id;
            self.next_id += 1;
            let mut body = Vec::new();
            body.extend_from_slice(&id.to_be_bytes());
            body_fn(&mut body);
            self.send(kind, &body);
            self.recv()
        }

        fn recv(&mut self) -> (u8, Vec<u8>) {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf).unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut packet = vec![0u8; len];
            self.stream.read_exact(&mut packet).unwrap();
            (packet[0], packet[1..].to_vec())
        }

        fn init(&mut self) {
            self.send(SSH_FXP_INIT, &SFTP_VERSION.to_be_bytes());
            let (kind, payload) = self.recv();
            assert_eq!(kind, SSH_FXP_VERSION);
            assert_eq!(u32::from_be_bytes(payload[..4].try_into().unwrap()), 3);
        }

        fn status_code(payload: &[u8]) -> u32 {
            u32::from_be_bytes(payload[4..8].try_into().unwrap())
        }
    }

    fn spawn_session() -> (Client, std::thread::JoinHandle<u64>) {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let mut server = server;
            let mut session = SftpSession::new();
            session.serve(&mut server).unwrap()
        });
        (
            Client {
                stream: client,
                next_id: 1,
            },
            handle,
        )
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("corral-sftp-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn open_write_read_round_trip() {
        let dir = tempdir();
        let file_path = dir.join("hello.txt").to_string_lossy().into_owned();
        let (mut client, server) = spawn_session();
        client.init();

        // OPEN with CREAT|WRITE|READ.
        let (kind, payload) = client.request(SSH_FXP_OPEN, |body| {
            put_string(body, file_path.as_bytes());
            body.extend_from_slice(
                &(SSH_FXF_READ | SSH_FXF_WRITE | SSH_FXF_CREAT).to_be_bytes(),
            );
            body.extend_from_slice(&0u32.to_be_bytes()); // empty attrs
        });
        assert_eq!(kind, SSH_FXP_HANDLE);
        let handle = payload[4..].to_vec(); // length-prefixed handle string
        let handle_str = &handle[4..];

        // WRITE at offset 0.
        let (kind, payload) = client.request(SSH_FXP_WRITE, |body| {
            put_string(body, handle_str);
            body.extend_from_slice(&0u64.to_be_bytes());
            put_string(body, b"payload-data");
        });
        assert_eq!(kind, SSH_FXP_STATUS);
        assert_eq!(Client::status_code(&payload), SSH_FX_OK);

        // READ it back.
        let (kind, payload) = client.request(SSH_FXP_READ, |body| {
            put_string(body, handle_str);
            body.extend_from_slice(&0u64.to_be_bytes());
            body.extend_from_slice(&1024u32.to_be_bytes());
        });
        assert_eq!(kind, SSH_FXP_DATA);
        let data_len = u32::from_be_bytes(payload[4..8].try_into().unwrap()) as usize;
        assert_eq!(&payload[8..8 + data_len], b"payload-data");

        // CLOSE, then EOF terminates the session.
        let (kind, payload) = client.request(SSH_FXP_CLOSE, |body| {
            put_string(body, handle_str);
        });
        assert_eq!(kind, SSH_FXP_STATUS);
        assert_eq!(Client::status_code(&payload), SSH_FX_OK);

        drop(client);
        let transactions = server.join().unwrap();
        assert_eq!(transactions, 5); // INIT + 4 requests

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn readdir_lists_and_ends_with_eof() {
        let dir = tempdir();
        std::fs::write(dir.join("a.txt"), b"a").unwrap();
        std::fs::write(dir.join("b.txt"), b"b").unwrap();
        let dir_path = dir.to_string_lossy().into_owned();

        let (mut client, server) = spawn_session();
        client.init();

        let (kind, payload) = client.request(SSH_FXP_OPENDIR, |body| {
            put_string(body, dir_path.as_bytes());
        });
        assert_eq!(kind, SSH_FXP_HANDLE);
        let handle = payload[8..].to_vec();

        let (kind, payload) = client.request(SSH_FXP_READDIR, |body| {
            put_string(body, &handle);
        });
        assert_eq!(kind, SSH_FXP_NAME);
        let count = u32::from_be_bytes(payload[4..8].try_into().unwrap());
        assert_eq!(count, 2);

        let (kind, payload) = client.request(SSH_FXP_READDIR, |body| {
            put_string(body, &handle);
        });
        assert_eq!(kind, SSH_FXP_STATUS);
        assert_eq!(Client::status_code(&payload), SSH_FX_EOF);

        drop(client);
        server.join().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stat_missing_file_reports_no_such_file() {
        let (mut client, server) = spawn_session();
        client.init();

        let (kind, payload) = client.request(SSH_FXP_STAT, |body| {
            put_string(body, b"/definitely/not/here");
        });
        assert_eq!(kind, SSH_FXP_STATUS);
        assert_eq!(Client::status_code(&payload), SSH_FX_NO_SUCH_FILE);

        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn realpath_cleans_lexically() {
        assert_eq!(clean_path("/a/b/../c/./d"), PathBuf::from("/a/c/d"));
        assert_eq!(clean_path("relative/x"), PathBuf::from("/relative/x"));
        assert_eq!(clean_path("/../.."), PathBuf::from("/"));
    }
}
