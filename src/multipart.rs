//! `multipart/form-data` request bodies.
//!
//! A [`Form`] collects named parts and encodes them into a fixed-length
//! [`Body`], so the body has a known `Content-Length` and can be sent again
//! when a redirect asks for it.
//!
//! ```
//! use courier::multipart::{Form, Part};
//!
//! let form = Form::new()
//!     .text("title", "holiday")
//!     .part("photo", Part::bytes(&b"\x89PNG"[..]).file_name("beach.png"));
//! assert!(form.content_type().starts_with("multipart/form-data; boundary="));
//! ```

use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut as _, Bytes, BytesMut};

use crate::Body;

/// A `multipart/form-data` form.
pub struct Form {
    boundary: String,
    parts: Vec<(String, Part)>,
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Form")
            .field("boundary", &self.boundary)
            .field("parts", &self.parts)
            .finish()
    }
}

impl Default for Form {
    fn default() -> Self {
        Self::new()
    }
}

impl Form {
    /// Create an empty form with a random boundary.
    pub fn new() -> Self {
        Self {
            boundary: format!("--------CourierFormBoundary{}", uuid::Uuid::new_v4().simple()),
            parts: Vec::new(),
        }
    }

    /// The boundary which separates parts.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Add a text field.
    pub fn text<N, V>(self, name: N, value: V) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        self.part(name, Part::text(value))
    }

    /// Add a part.
    pub fn part<N: Into<String>>(mut self, name: N, part: Part) -> Self {
        self.parts.push((name.into(), part));
        self
    }

    /// The `Content-Type` header value for this form.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// The encoded length of the form, in bytes.
    pub fn content_length(&self) -> u64 {
        let parts: usize = self
            .parts
            .iter()
            .map(|(name, part)| self.part_head(name, part).len() + part.data.len() + 2)
            .sum();
        (parts + self.boundary.len() + 6) as u64
    }

    /// Encode the form into a request body.
    pub fn into_body(self) -> Body {
        Body::full(self.encode())
    }

    fn part_head(&self, name: &str, part: &Part) -> String {
        let mut head = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
            self.boundary,
            escape(name)
        );
        if let Some(file_name) = &part.file_name {
            head.push_str(&format!("; filename=\"{}\"", escape(file_name)));
        }
        head.push_str("\r\n");
        if let Some(content_type) = part.content_type() {
            head.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        head.push_str("\r\n");
        head
    }

    fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.content_length() as usize);
        for (name, part) in &self.parts {
            buffer.put_slice(self.part_head(name, part).as_bytes());
            buffer.put_slice(&part.data);
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        buffer.freeze()
    }
}

/// One field of a [`Form`].
#[derive(Clone)]
pub struct Part {
    data: Bytes,
    file_name: Option<String>,
    mime: Option<String>,
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("len", &self.data.len())
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .finish()
    }
}

impl Part {
    /// A text value.
    pub fn text<V: Into<String>>(value: V) -> Self {
        Self::bytes(value.into())
    }

    /// Raw bytes.
    pub fn bytes<D: Into<Bytes>>(data: D) -> Self {
        Self {
            data: data.into(),
            file_name: None,
            mime: None,
        }
    }

    /// Send the part as a file called `name`.
    ///
    /// Unless set with [`Part::mime`], the content type is guessed from the
    /// file name's extension, falling back to `application/octet-stream`.
    pub fn file_name<N: Into<String>>(mut self, name: N) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Set the content type of the part.
    pub fn mime<M: Into<String>>(mut self, mime: M) -> Self {
        self.mime = Some(mime.into());
        self
    }

    fn content_type(&self) -> Option<Cow<'_, str>> {
        match (&self.mime, &self.file_name) {
            (Some(mime), _) => Some(Cow::Borrowed(mime)),
            (None, Some(file_name)) => Some(Cow::Owned(
                mime_guess::from_path(file_name)
                    .first_or_octet_stream()
                    .to_string(),
            )),
            (None, None) => None,
        }
    }
}

/// Percent-encode the characters which would end a quoted parameter.
fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(&['"', '\r', '\n'][..]) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(
        value
            .replace('"', "%22")
            .replace('\r', "%0D")
            .replace('\n', "%0A"),
    )
}
