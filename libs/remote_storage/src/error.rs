/// Reasons for downloads or listings to fail.
#[derive(Debug)]
pub enum DownloadError {
    /// Validation or other error happened due to user input.
    BadInput(anyhow::Error),
    /// The file was not found in the remote storage.
    NotFound,
    /// The caller provided a cancellation token which aborted the operation.
    Cancelled,
    /// A timeout happened while executing the request.
    Timeout,
    /// Some integrity or other unexpected error happened.
    Other(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => {
                write!(f, "Failed to download a remote file due to user input: {e}")
            }
            DownloadError::NotFound => write!(f, "No file found for the remote object id given"),
            DownloadError::Cancelled => write!(f, "Cancelled, shutting down"),
            DownloadError::Timeout => write!(f, "timeout"),
            DownloadError::Other(e) => write!(f, "Failed to download a remote file: {e:?}"),
        }
    }
}

impl std::error::Error for DownloadError {}

impl DownloadError {
    /// Returns true if the error should not be retried with current settings
    pub fn is_permanent(&self) -> bool {
        use DownloadError::*;
        match self {
            BadInput(_) | NotFound | Cancelled => true,
            Timeout | Other(_) => false,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(value: std::io::Error) -> Self {
        let needs_unwrap = value.kind() == std::io::ErrorKind::Other
            && value
                .get_ref()
                .and_then(|x| x.downcast_ref::<DownloadError>())
                .is_some();

        if needs_unwrap {
            *value
                .into_inner()
                .expect("just checked")
                .downcast::<DownloadError>()
                .expect("just checked")
        } else {
            DownloadError::Other(value.into())
        }
    }
}
