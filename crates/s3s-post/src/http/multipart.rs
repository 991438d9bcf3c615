//! multipart/form-data decoding for presigned POST uploads
//!
//! See <https://docs.aws.amazon.com/AmazonS3/latest/API/RESTObjectPOST.html>
//!

use crate::error::StdError;

use std::fmt::{self, Debug};
use std::mem;
use std::pin::Pin;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use memchr::{memchr_iter, memmem};
use transform_stream::{AsyncTryStream, Yielder};

/// RFC 2046 caps boundaries at 70 characters.
const MAX_BOUNDARY_LEN: usize = 70;

/// Upper bound for the header block of a single part.
const MAX_PART_HEADER_SIZE: usize = 8 * 1024;

const MAX_PART_HEADERS: usize = 8;

/// Size limits applied while decoding the form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartLimits {
    /// Maximum size of one field value.
    pub max_field_size: usize,
    /// Maximum size of all field names and values, and of the trailer after the file.
    pub max_fields_size: usize,
    /// Maximum number of parts, the file part included.
    pub max_parts: usize,
}

impl Default for MultipartLimits {
    fn default() -> Self {
        Self {
            max_field_size: 1024 * 1024,
            max_fields_size: 20 * 1024 * 1024,
            max_parts: 1000,
        }
    }
}

/// A non-file form field. The name is lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub value: String,
}

/// The file part of the form.
#[derive(Debug)]
pub struct FilePart {
    pub filename: String,
    pub content_type: Option<String>,
    stream: Option<FileStream>,
}

/// A decoded form: every field preceding the file part, and the file itself.
#[derive(Debug)]
pub struct Multipart {
    fields: Vec<FormField>,
    file: FilePart,
}

impl Multipart {
    /// Fields sorted by name.
    #[must_use]
    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    #[must_use]
    pub fn file(&self) -> &FilePart {
        &self.file
    }

    pub fn take_file_stream(&mut self) -> Option<FileStream> {
        self.file.stream.take()
    }

    /// Finds a field value by its lower-cased name.
    #[must_use]
    pub fn find_field_value<'a>(&'a self, name: &str) -> Option<&'a str> {
        find_field_value(&self.fields, name)
    }
}

/// Finds a field value by its lower-cased name in fields sorted by name.
#[must_use]
pub fn find_field_value<'a>(fields: &'a [FormField], name: &str) -> Option<&'a str> {
    let idx = fields.binary_search_by(|f| f.name.as_str().cmp(name)).ok()?;
    fields.get(idx).map(|f| f.value.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("MultipartError: Underlying: {0}")]
    Underlying(StdError),
    #[error("MultipartError: InvalidFormat")]
    InvalidFormat,
    #[error("MultipartError: DuplicateField: {0}")]
    DuplicateField(String),
    #[error("MultipartError: MissingFile")]
    MissingFile,
    #[error("MultipartError: FieldTooLarge: field size {0} bytes exceeds limit of {1} bytes")]
    FieldTooLarge(usize, usize),
    #[error("MultipartError: TotalSizeTooLarge: total form fields size {0} bytes exceeds limit of {1} bytes")]
    TotalSizeTooLarge(usize, usize),
    #[error("MultipartError: TooManyParts: part count {0} exceeds limit of {1}")]
    TooManyParts(usize, usize),
}

/// Decodes the form up to the file part.
///
/// The returned [`Multipart`] owns the rest of the body through its
/// [`FileStream`]; nothing after the file part header has been read yet
/// except what arrived in the same chunk.
///
/// # Errors
/// Returns an `Err` if the framing is invalid, a limit is exceeded, or the
/// body ends before a file part.
pub async fn transform_multipart<S>(body_stream: S, boundary: &[u8], limits: MultipartLimits) -> Result<Multipart, MultipartError>
where
    S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
{
    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(MultipartError::InvalidFormat);
    }

    let mut body = Box::pin(body_stream);
    let mut buf: Vec<u8> = Vec::new();
    let mut parser = FormParser::new(boundary, limits);

    loop {
        match body.as_mut().next().await {
            None => return Err(parser.eof_error()),
            Some(Err(e)) => return Err(MultipartError::Underlying(e)),
            Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
        }

        if let Some(head) = parser.advance(&buf)? {
            let remaining = Bytes::from(buf).split_off(head.offset);
            let stream = FileStream::new(body, boundary, remaining, limits.max_fields_size);
            let file = FilePart {
                filename: head.filename,
                content_type: head.content_type,
                stream: Some(stream),
            };
            return parser.finish(file);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Preamble { skipped_empty_line: bool },
    PartHeaders,
    FieldValue,
}

struct FileHead {
    filename: String,
    content_type: Option<String>,
    offset: usize,
}

/// Incremental parser over the buffered prefix of the body.
///
/// `cursor` marks the first byte not yet consumed; bytes before it are never
/// scanned again.
struct FormParser {
    /// `--{boundary}`
    dash_boundary: Box<[u8]>,
    /// `\r\n--{boundary}`
    crlf_pat: Box<[u8]>,
    limits: MultipartLimits,
    state: ParseState,
    cursor: usize,
    fields: Vec<FormField>,
    pending_name: Option<String>,
    fields_size: usize,
    parts: usize,
    saw_terminal: bool,
}

impl FormParser {
    fn new(boundary: &[u8], limits: MultipartLimits) -> Self {
        Self {
            dash_boundary: [b"--".as_slice(), boundary].concat().into(),
            crlf_pat: crlf_pattern(boundary),
            limits,
            state: ParseState::Preamble { skipped_empty_line: false },
            cursor: 0,
            fields: Vec::new(),
            pending_name: None,
            fields_size: 0,
            parts: 0,
            saw_terminal: false,
        }
    }

    fn eof_error(&self) -> MultipartError {
        if self.saw_terminal {
            MultipartError::MissingFile
        } else {
            MultipartError::InvalidFormat
        }
    }

    /// Consumes as much of `buf` as possible. Returns the file part header once reached.
    fn advance(&mut self, buf: &[u8]) -> Result<Option<FileHead>, MultipartError> {
        loop {
            let rest = buf.get(self.cursor..).unwrap_or_default();
            let progressed = match self.state {
                ParseState::Preamble { skipped_empty_line } => self.parse_opening(rest, skipped_empty_line)?,
                ParseState::PartHeaders => match self.parse_part_headers(rest)? {
                    PartHeaders::NeedMore => false,
                    PartHeaders::Field => true,
                    PartHeaders::File(head) => return Ok(Some(head)),
                },
                ParseState::FieldValue => self.parse_field_value(rest)?,
            };
            if !progressed {
                return Ok(None);
            }
        }
    }

    fn parse_opening(&mut self, rest: &[u8], skipped_empty_line: bool) -> Result<bool, MultipartError> {
        let Some(end) = memmem::find(rest, b"\r\n") else {
            if rest.len() > self.dash_boundary.len() + 4 {
                return Err(MultipartError::InvalidFormat);
            }
            return Ok(false);
        };
        let line = &rest[..end];
        if line.is_empty() && !skipped_empty_line {
            self.cursor += 2;
            self.state = ParseState::Preamble { skipped_empty_line: true };
            return Ok(true);
        }
        if *line == *self.dash_boundary {
            self.cursor += end + 2;
            self.state = ParseState::PartHeaders;
            return Ok(true);
        }
        if line.strip_prefix(&*self.dash_boundary) == Some(b"--".as_slice()) {
            self.saw_terminal = true;
            return Err(MultipartError::MissingFile);
        }
        Err(MultipartError::InvalidFormat)
    }

    fn parse_part_headers(&mut self, rest: &[u8]) -> Result<PartHeaders, MultipartError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
        let (len, headers) = match httparse::parse_headers(rest, &mut headers) {
            Ok(httparse::Status::Complete(ans)) => ans,
            Ok(httparse::Status::Partial) => {
                if rest.len() > MAX_PART_HEADER_SIZE {
                    return Err(MultipartError::InvalidFormat);
                }
                return Ok(PartHeaders::NeedMore);
            }
            Err(_) => return Err(MultipartError::InvalidFormat),
        };

        self.parts += 1;
        if self.parts > self.limits.max_parts {
            return Err(MultipartError::TooManyParts(self.parts, self.limits.max_parts));
        }

        let info = PartInfo::from_headers(headers).ok_or(MultipartError::InvalidFormat)?;
        self.cursor += len;

        match info.disposition.filename {
            Some(filename) => Ok(PartHeaders::File(FileHead {
                filename: filename.to_owned(),
                content_type: info.content_type.map(str::to_owned),
                offset: self.cursor,
            })),
            None => {
                self.pending_name = Some(info.disposition.name.to_ascii_lowercase());
                self.state = ParseState::FieldValue;
                Ok(PartHeaders::Field)
            }
        }
    }

    fn parse_field_value(&mut self, rest: &[u8]) -> Result<bool, MultipartError> {
        let max_field_size = self.limits.max_field_size;

        let Some(pos) = memmem::find(rest, &self.crlf_pat) else {
            let seen = rest.len().saturating_sub(self.crlf_pat.len());
            if seen > max_field_size {
                return Err(MultipartError::FieldTooLarge(seen, max_field_size));
            }
            return Ok(false);
        };

        let after = &rest[pos + self.crlf_pat.len()..];
        let Some(tail) = after.get(..2) else { return Ok(false) };

        let value = &rest[..pos];
        if value.len() > max_field_size {
            return Err(MultipartError::FieldTooLarge(value.len(), max_field_size));
        }

        let name = self.pending_name.take().ok_or(MultipartError::InvalidFormat)?;
        self.fields_size = self.fields_size.saturating_add(name.len()).saturating_add(value.len());
        if self.fields_size > self.limits.max_fields_size {
            return Err(MultipartError::TotalSizeTooLarge(self.fields_size, self.limits.max_fields_size));
        }

        let value = std::str::from_utf8(value).map_err(|_| MultipartError::InvalidFormat)?;
        self.fields.push(FormField {
            name,
            value: value.to_owned(),
        });

        match tail {
            b"\r\n" => {
                self.cursor += pos + self.crlf_pat.len() + 2;
                self.state = ParseState::PartHeaders;
                Ok(true)
            }
            b"--" => {
                self.saw_terminal = true;
                Err(MultipartError::MissingFile)
            }
            _ => Err(MultipartError::InvalidFormat),
        }
    }

    fn finish(self, file: FilePart) -> Result<Multipart, MultipartError> {
        let mut fields = self.fields;
        fields.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        if let Some(dup) = fields.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(MultipartError::DuplicateField(dup[0].name.clone()));
        }
        Ok(Multipart { fields, file })
    }
}

enum PartHeaders {
    NeedMore,
    Field,
    File(FileHead),
}

/// `\r\n--{boundary}`
fn crlf_pattern(boundary: &[u8]) -> Box<[u8]> {
    let mut v = Vec::with_capacity(boundary.len().saturating_add(4));
    v.extend_from_slice(b"\r\n--");
    v.extend_from_slice(boundary);
    v.into()
}

struct PartInfo<'a> {
    disposition: ContentDisposition<'a>,
    content_type: Option<&'a str>,
}

impl<'a> PartInfo<'a> {
    fn from_headers(headers: &[httparse::Header<'a>]) -> Option<Self> {
        let mut disposition = None;
        let mut content_type = None;
        for header in headers {
            if header.name.eq_ignore_ascii_case("Content-Disposition") {
                disposition = Some(parse_content_disposition(header.value).ok()?.1);
            } else if header.name.eq_ignore_ascii_case("Content-Type") {
                content_type = Some(std::str::from_utf8(header.value).ok()?);
            }
        }
        Some(Self {
            disposition: disposition?,
            content_type,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileStreamError {
    /// The body ended before the terminal delimiter.
    #[error("FileStreamError: Incomplete")]
    Incomplete,
    #[error("FileStreamError: Underlying: {0}")]
    Underlying(StdError),
    /// The parts following the file are not well-formed.
    #[error("FileStreamError: InvalidFormat")]
    InvalidFormat,
    /// A second part carrying a filename follows the file.
    #[error("FileStreamError: DuplicateFile")]
    DuplicateFile,
    #[error("FileStreamError: TrailerTooLarge: trailer exceeds limit of {0} bytes")]
    TrailerTooLarge(usize),
}

/// The bytes of the file part.
///
/// The stream ends once the delimiter closing the file has been found and the
/// rest of the form has been checked. A stream that ends without an error has
/// therefore seen a well-formed form with exactly one file part.
pub struct FileStream {
    inner: AsyncTryStream<Bytes, FileStreamError, BoxFuture<'static, Result<(), FileStreamError>>>,
}

impl Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileStream {{...}}")
    }
}

impl FileStream {
    fn new<S>(body: Pin<Box<S>>, boundary: &[u8], prev_bytes: Bytes, trailer_limit: usize) -> Self
    where
        S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
    {
        let crlf_pat = crlf_pattern(boundary);
        Self {
            inner: AsyncTryStream::new(move |y| -> BoxFuture<'static, Result<(), FileStreamError>> {
                Box::pin(generate(y, body, crlf_pat, prev_bytes, trailer_limit))
            }),
        }
    }
}

async fn generate<S>(
    mut y: Yielder<Result<Bytes, FileStreamError>>,
    mut body: Pin<Box<S>>,
    crlf_pat: Box<[u8]>,
    prev_bytes: Bytes,
    trailer_limit: usize,
) -> Result<(), FileStreamError>
where
    S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
{
    // 1: read, 2: scan `bytes`, 3: `buf` holds a partial delimiter
    let mut state: u8 = if prev_bytes.is_empty() { 1 } else { 2 };
    let mut bytes = prev_bytes;
    let mut buf: Vec<u8> = Vec::new();

    'dfa: loop {
        match state {
            1 => {
                bytes = next_chunk(&mut body).await?;
                state = 2;
            }
            2 => {
                for idx in memchr_iter(b'\r', bytes.as_ref()) {
                    let remaining = &bytes[idx..];

                    if remaining.len() >= crlf_pat.len() {
                        if remaining.starts_with(&crlf_pat) {
                            let trailer = bytes.split_off(idx + crlf_pat.len());
                            bytes.truncate(idx);
                            if !bytes.is_empty() {
                                y.yield_ok(bytes).await;
                            }
                            return check_trailer(&mut body, trailer, &crlf_pat, trailer_limit).await;
                        }
                        continue;
                    }

                    if crlf_pat.starts_with(remaining) {
                        let head = bytes.split_to(idx);
                        if !head.is_empty() {
                            y.yield_ok(head).await;
                        }
                        buf.extend_from_slice(&bytes);
                        bytes.clear();
                        state = 3;
                        continue 'dfa;
                    }
                }

                let chunk = mem::take(&mut bytes);
                if !chunk.is_empty() {
                    y.yield_ok(chunk).await;
                }
                state = 1;
            }
            3 => {
                let chunk = next_chunk(&mut body).await?;
                buf.extend_from_slice(&chunk);
                bytes = Bytes::from(mem::take(&mut buf));
                state = 2;
            }
            _ => unreachable!(),
        }
    }
}

async fn next_chunk<S>(body: &mut Pin<Box<S>>) -> Result<Bytes, FileStreamError>
where
    S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
{
    match body.as_mut().next().await {
        None => Err(FileStreamError::Incomplete),
        Some(Err(e)) => Err(FileStreamError::Underlying(e)),
        Some(Ok(b)) => Ok(b),
    }
}

/// Reads everything after the file delimiter and checks it.
async fn check_trailer<S>(body: &mut Pin<Box<S>>, head: Bytes, crlf_pat: &[u8], limit: usize) -> Result<(), FileStreamError>
where
    S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
{
    let mut buf = Vec::from(head);
    if buf.len() > limit {
        return Err(FileStreamError::TrailerTooLarge(limit));
    }
    loop {
        if scan_trailer(&buf, crlf_pat)? {
            return Ok(());
        }
        let chunk = next_chunk(body).await?;
        if buf.len().saturating_add(chunk.len()) > limit {
            return Err(FileStreamError::TrailerTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
}

/// `trailer` starts right after a `\r\n--{boundary}` delimiter.
///
/// Returns `Ok(true)` once the terminal delimiter is reached, `Ok(false)` if
/// more bytes are needed.
fn scan_trailer(trailer: &[u8], crlf_pat: &[u8]) -> Result<bool, FileStreamError> {
    let mut rest = trailer;
    loop {
        let Some(tail) = rest.get(..2) else { return Ok(false) };
        match tail {
            b"--" => return Ok(true),
            b"\r\n" => rest = &rest[2..],
            _ => return Err(FileStreamError::InvalidFormat),
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
        let len = match httparse::parse_headers(rest, &mut headers) {
            Ok(httparse::Status::Complete((len, headers))) => {
                let info = PartInfo::from_headers(headers).ok_or(FileStreamError::InvalidFormat)?;
                if info.disposition.filename.is_some() {
                    return Err(FileStreamError::DuplicateFile);
                }
                len
            }
            Ok(httparse::Status::Partial) => return Ok(false),
            Err(_) => return Err(FileStreamError::InvalidFormat),
        };
        rest = &rest[len..];

        match memmem::find(rest, crlf_pat) {
            None => return Ok(false),
            Some(pos) => rest = &rest[pos + crlf_pat.len()..],
        }
    }
}

impl Stream for FileStream {
    type Item = Result<Bytes, FileStreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}

#[derive(Debug)]
struct ContentDisposition<'a> {
    name: &'a str,
    filename: Option<&'a str>,
}

fn parse_content_disposition(input: &[u8]) -> nom::IResult<&[u8], ContentDisposition<'_>> {
    use nom::Parser;
    use nom::bytes::complete::{tag, take, take_till, take_till1};
    use nom::combinator::{all_consuming, map_res, opt};
    use nom::sequence::{delimited, preceded};

    let parse_name = delimited(
        tag(&b"name=\""[..]),
        map_res(take_till1(|c| c == b'"'), std::str::from_utf8),
        take(1_usize),
    );

    let parse_filename = delimited(
        tag(&b"filename=\""[..]),
        map_res(take_till(|c| c == b'"'), std::str::from_utf8),
        take(1_usize),
    );

    let mut parse = all_consuming((
        preceded(tag(&b"form-data; "[..]), parse_name),
        opt(preceded(tag(&b"; "[..]), parse_filename)),
    ));

    let (remaining, (name, filename)) = parse.parse(input)?;

    Ok((remaining, ContentDisposition { name, filename }))
}
