use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use flarm_core::{FlarmError, FlarmResult, TransferProgress, Transport};
use reqwest::blocking::{Client, Response};
use tracing::debug;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

const USER_AGENT: &str = concat!("flarm/", env!("CARGO_PKG_VERSION"));
const READ_BUFFER_SIZE: usize = 8192;

/// Blocking HTTP transport. Every request, body reads included, is bounded by the
/// client timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> FlarmResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| FlarmError::Network {
                url: String::new(),
                reason: format!("failed to create HTTP client: {err}"),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn get(&self, url: &str) -> FlarmResult<Response> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| request_error(url, &err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FlarmError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl Transport for HttpTransport {
    fn fetch_bytes(&self, url: &str) -> FlarmResult<Vec<u8>> {
        debug!(%url, "fetching");
        let mut response = self.get(url)?;
        let mut bytes = Vec::new();
        response
            .read_to_end(&mut bytes)
            .map_err(|err| read_error(url, &err))?;
        Ok(bytes)
    }

    fn fetch_with_progress(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(TransferProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64> {
        debug!(%url, dest = %dest.display(), "downloading");
        let mut response = self.get(url)?;
        let total = response.content_length();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                FlarmError::io(format!("failed to create {}", parent.display()), err)
            })?;
        }
        let partial = dest.with_extension("part");
        let result = stream_to_file(&mut response, url, &partial, total, on_progress);
        let downloaded = match result {
            Ok(downloaded) => downloaded,
            Err(err) => {
                let _ = fs::remove_file(&partial);
                return Err(err);
            }
        };

        fs::rename(&partial, dest).map_err(|err| {
            FlarmError::io(
                format!("failed to move download into {}", dest.display()),
                err,
            )
        })?;
        Ok(downloaded)
    }
}

fn stream_to_file(
    response: &mut Response,
    url: &str,
    partial: &Path,
    total: Option<u64>,
    on_progress: &mut dyn FnMut(TransferProgress) -> ControlFlow<()>,
) -> FlarmResult<u64> {
    let mut file = File::create(partial)
        .map_err(|err| FlarmError::io(format!("failed to create {}", partial.display()), err))?;

    let mut downloaded = 0u64;
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let started = TransferProgress {
        bytes_done: 0,
        bytes_total: total,
    };
    if on_progress(started).is_break() {
        return Err(FlarmError::Cancelled);
    }

    loop {
        let read = response
            .read(&mut buffer)
            .map_err(|err| read_error(url, &err))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read]).map_err(|err| {
            FlarmError::io(format!("failed to write {}", partial.display()), err)
        })?;
        downloaded += read as u64;

        let progress = TransferProgress {
            bytes_done: downloaded,
            bytes_total: total,
        };
        if on_progress(progress).is_break() {
            return Err(FlarmError::Cancelled);
        }
    }

    file.flush()
        .map_err(|err| FlarmError::io(format!("failed to write {}", partial.display()), err))?;
    Ok(downloaded)
}

fn request_error(url: &str, err: &reqwest::Error) -> FlarmError {
    if err.is_timeout() {
        return FlarmError::NetworkTimeout {
            url: url.to_string(),
        };
    }
    FlarmError::Network {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

fn read_error(url: &str, err: &io::Error) -> FlarmError {
    let timed_out = err.kind() == io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .is_some_and(reqwest::Error::is_timeout);
    if timed_out {
        return FlarmError::NetworkTimeout {
            url: url.to_string(),
        };
    }
    FlarmError::Network {
        url: url.to_string(),
        reason: err.to_string(),
    }
}
