#[cfg(test)]
mod tests;

use std::{
    io::Read,
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{digest::Digest, EventHandler, ImageRef, MediaType};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("{0}")]
    Client(#[from] Box<ureq::Error>),

    #[error("Missing authentication tokens.")]
    MissingTokens,

    #[error("Missing Location header in upload response.")]
    MissingLocation,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ureq::Error> for HttpError {
    fn from(value: ureq::Error) -> Self {
        HttpError::Client(Box::new(value))
    }
}

/// Body of a request.
#[derive(Copy, Clone)]
enum Body<'b> {
    Empty,
    Bytes(&'b [u8]),
}

/// HTTP client for a single repository in a registry.
pub(crate) struct Client {
    event_handler: Arc<dyn EventHandler>,
    auth_token: RwLock<Option<String>>,

    /// Scheme and address of the registry, like `https://example.com`.
    origin: String,

    /// URL prefix for the repository API (`$origin/v2/$repository`).
    base: String,
}

impl Client {
    /// Create a new HTTP client to the repository in `reference`.
    ///
    /// It tries to guess the URI scheme for the registry:
    ///
    /// * If it is `localhost`, a loopback IP (like `127.0.0.1`), or if
    ///   the port is `:80`, it uses `http://`.
    /// * In any other case, it uses `https://`.
    pub fn new(reference: &ImageRef, event_handler: Arc<dyn EventHandler>) -> Self {
        let registry = reference.registry();
        let origin = format!("{}{}", guess_scheme(registry), registry);
        let base = format!("{}/v2/{}", origin, reference.repository);

        Client {
            event_handler,
            auth_token: Default::default(),
            origin,
            base,
        }
    }

    /// Send a `GET` request to the registry.
    ///
    /// The path must not include the `v2/$repository` prefix.
    pub fn get(&self, path: &str, accept: Option<&str>) -> Result<ureq::Response, HttpError> {
        let mut request = ureq::get(&format!("{}/{}", self.base, path));
        if let Some(accept) = accept {
            request = request.set("Accept", accept);
        }

        self.send(request, Body::Empty)
    }

    /// Send a `GET` request to download a blob.
    pub fn download_blob(&self, blob: &Digest) -> Result<Box<dyn Read + Send>, HttpError> {
        let response = self.get(&format!("blobs/{}", blob.source()), None)?;
        Ok(Box::new(response.into_reader()))
    }

    /// Check if the registry already has a blob.
    pub fn has_blob(&self, blob: &Digest) -> Result<bool, HttpError> {
        let request = ureq::head(&format!("{}/blobs/{}", self.base, blob.source()));

        match self.send(request, Body::Empty) {
            Ok(_) => Ok(true),
            Err(HttpError::Client(e)) if matches!(*e, ureq::Error::Status(404, _)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Upload a blob in a single request.
    ///
    /// See <https://distribution.github.io/distribution/spec/api/#monolithic-upload>.
    pub fn upload_blob(&self, blob: &Digest, data: &[u8]) -> Result<(), HttpError> {
        let request = ureq::post(&format!("{}/blobs/uploads/", self.base));
        let response = self.send(request, Body::Empty)?;

        let location = response
            .header("Location")
            .ok_or(HttpError::MissingLocation)?;

        let url = if location.starts_with("http://") || location.starts_with("https://") {
            location.to_owned()
        } else {
            format!("{}{}", self.origin, location)
        };

        let request = ureq::put(&url)
            .query("digest", blob.source())
            .set("Content-Type", "application/octet-stream");

        self.send(request, Body::Bytes(data))?;

        Ok(())
    }

    /// Send the manifest for `tag`.
    pub fn put_manifest(
        &self,
        tag: &str,
        media_type: MediaType,
        data: &[u8],
    ) -> Result<(), HttpError> {
        let request = ureq::put(&format!("{}/manifests/{}", self.base, tag))
            .set("Content-Type", media_type.as_str());

        self.send(request, Body::Bytes(data))?;
        Ok(())
    }

    /// Send a request to the registry.
    ///
    /// If it responds with a `401` error, get the token from the
    /// URL in the `WWW-Authenticate` header, and repeat the request.
    /// This is also done when we already have a token, since the
    /// registry may require a different scope (like `push`).
    fn send(&self, request: ureq::Request, body: Body) -> Result<ureq::Response, HttpError> {
        let request = request.set("User-Agent", USER_AGENT);

        self.event_handler
            .registry_request(request.method(), request.url());

        let mut authenticated = false;

        loop {
            let mut attempt = request.clone();

            let auth_token = self
                .auth_token
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();

            if let Some(auth) = auth_token.as_deref() {
                attempt = attempt.set("Authorization", auth);
            }

            let result = match body {
                Body::Empty => attempt.call(),
                Body::Bytes(data) => attempt.send_bytes(data),
            };

            let response = match result {
                Ok(r) => return Ok(r),
                Err(ureq::Error::Status(401, r)) if !authenticated => r,
                Err(e) => return Err(e.into()),
            };

            // Request a token if the response from the 401 includes the
            // WWW-Authenticate header.
            //
            // The response from the `realm` URL must include either
            // `token` or `access_token`.

            let Some(auth_request) = response
                .header("www-authenticate")
                .and_then(build_auth_request)
            else {
                return Err(ureq::Error::Status(401, response).into());
            };

            self.event_handler.registry_auth(auth_request.url());

            #[derive(serde::Deserialize, Debug)]
            struct Tokens {
                token: Option<String>,
                access_token: Option<String>,
            }

            let mut token = match serde_json::from_reader(auth_request.call()?.into_reader())? {
                Tokens { token: Some(t), .. } => t,
                Tokens {
                    access_token: Some(t),
                    ..
                } => t,
                _ => return Err(HttpError::MissingTokens),
            };

            token.insert_str(0, "Bearer ");
            *self
                .auth_token
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(token);

            authenticated = true;
        }
    }
}

fn guess_scheme(registry: &str) -> &'static str {
    const HTTP: &str = "http://";
    const HTTPS: &str = "https://";

    if registry.ends_with(":80") {
        return HTTP;
    }

    if registry.split(':').next() == Some("localhost") {
        return HTTP;
    }

    if let Ok(address) = SocketAddr::from_str(registry) {
        return if address.ip().is_loopback() {
            HTTP
        } else {
            HTTPS
        };
    }

    HTTPS
}

/// Parse a `WWW-Authenticate` header and build the request to
/// get the authentication token.
///
/// Return `None` if the header can't be parsed.
///
/// See <https://distribution.github.io/distribution/spec/auth/token/>
/// for more details.
fn build_auth_request(auth_spec: &str) -> Option<ureq::Request> {
    let mut request = None;
    let mut pending_params = vec![];

    // The first token must be `Bearer`
    let mut tail = auth_spec.strip_prefix("Bearer ")?;

    loop {
        let (key, value) = tail.split_once('=')?;
        let key = key.trim_ascii();
        let (value, after) = value.strip_prefix('"')?.split_once('"')?;

        if key == "realm" {
            request = Some(
                pending_params
                    .drain(..)
                    .fold(ureq::get(value), |r, (k, v)| r.query(k, v)),
            );
        } else {
            match request.take() {
                Some(r) => request = Some(r.query(key, value)),
                None => pending_params.push((key, value)),
            }
        }

        tail = match after.trim_ascii_start() {
            "" => return request,
            t => t.strip_prefix(',')?,
        };
    }
}

#[test]
fn scheme_for_local_registries() {
    assert_eq!(guess_scheme("127.0.0.1:5000"), "http://");
    assert_eq!(guess_scheme("[::1]:5000"), "http://");
    assert_eq!(guess_scheme("example.com:80"), "http://");
    assert_eq!(guess_scheme("localhost:5000"), "http://");
    assert_eq!(guess_scheme("localhost.example.com"), "https://");
    assert_eq!(guess_scheme("10.1.2.3:5000"), "https://");
    assert_eq!(guess_scheme("registry-1.docker.io"), "https://");
}
