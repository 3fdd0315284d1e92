//! The request channel: a named FIFO carrying fixed-size request records.
//!
//! Every requester opens it for writing and sends one record; the server
//! reads it. Records are written with a single `write(2)` no larger than
//! `PIPE_BUF`, so concurrent requesters never interleave.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::{ffi::OsStrExt, fs::FileTypeExt},
    path::{Path, PathBuf},
};

use tokio::{io::AsyncReadExt, net::unix::pipe};

use crate::{
    error::{Result, ScanError},
    request::{Request, RequestRecord, RECORD_SIZE},
};

const _: () = assert!(RECORD_SIZE <= libc::PIPE_BUF);

/// Attempts at replacing a stale FIFO before giving up.
const CREATE_ATTEMPTS: usize = 4;

/// Creates the FIFO at `path`, replacing whatever is already there.
pub fn create_channel(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ScanError::input(format!("channel path {} contains NUL", path.display())))?;

    for attempt in 1..=CREATE_ATTEMPTS {
        // SAFETY: `c_path` is a valid NUL-terminated string.
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) } == 0 {
            tracing::info!(path = %path.display(), "request channel created");
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(ScanError::resource(
                format!("creating channel {}", path.display()),
                err,
            ));
        }

        tracing::warn!(path = %path.display(), attempt, "removing existing request channel");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ScanError::resource(
                    format!("removing channel {}", path.display()),
                    e,
                ))
            }
        }
    }

    Err(ScanError::resource(
        format!(
            "creating channel {} ({CREATE_ATTEMPTS} attempts)",
            path.display()
        ),
        io::ErrorKind::AlreadyExists.into(),
    ))
}

/// Write end, one per requester.
#[derive(Debug)]
pub struct RequestSender {
    file: File,
    path: PathBuf,
}

impl RequestSender {
    /// Blocks until the server has the channel open for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let context = || format!("opening channel {} for writing", path.display());

        let is_fifo = std::fs::metadata(path)
            .map_err(|e| ScanError::resource(context(), e))?
            .file_type()
            .is_fifo();
        if !is_fifo {
            return Err(ScanError::resource(
                context(),
                io::Error::new(io::ErrorKind::InvalidInput, "not a FIFO"),
            ));
        }

        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| ScanError::resource(context(), e))?;

        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn send(&mut self, request: &Request) -> Result<()> {
        let record = request.to_record();
        let written = self
            .file
            .write(record.as_bytes())
            .map_err(|e| ScanError::resource(format!("writing to {}", self.path.display()), e))?;

        if written != RECORD_SIZE {
            return Err(ScanError::resource(
                format!("writing to {}", self.path.display()),
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write of {written} bytes"),
                ),
            ));
        }
        Ok(())
    }
}

/// Read end, owned by the server.
#[derive(Debug)]
pub struct RequestReceiver {
    pipe: pipe::Receiver,
    path: PathBuf,
}

impl RequestReceiver {
    /// Must be called from within a tokio runtime.
    ///
    /// The receiver also holds the channel open for writing, so it never sees
    /// end-of-stream while no requester is connected.
    pub fn open(path: &Path) -> Result<Self> {
        let pipe = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(path)
            .map_err(|e| {
                ScanError::resource(format!("opening channel {} for reading", path.display()), e)
            })?;

        Ok(Self {
            pipe,
            path: path.to_owned(),
        })
    }

    /// Waits for one full record.
    ///
    /// I/O failures are `Resource` errors; a record with an out-of-range
    /// count or operation code is an `Input` error and the channel stays
    /// usable.
    pub async fn receive(&mut self) -> Result<Request> {
        let mut buf = [0u8; RECORD_SIZE];
        self.pipe
            .read_exact(&mut buf)
            .await
            .map_err(|e| ScanError::resource(format!("reading from {}", self.path.display()), e))?;

        Request::try_from(RequestRecord::from_bytes(&buf))
    }
}
