#![forbid(unsafe_code)]

use std::time::Duration;

use bytes::BytesMut;

const MAX_PENDING_LINE: usize = 64 * 1024;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
	pub event: Option<String>,
	pub data: String,
	pub id: Option<String>,
	pub retry: Option<Duration>,
}

/// Incremental `text/event-stream` decoder. Feed arbitrary chunks; complete
/// events come out once their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
	buf: BytesMut,
	event: Option<String>,
	data: Vec<String>,
	id: Option<String>,
	retry: Option<Duration>,
	last_event_id: Option<String>,
	reconnect_delay: Option<Duration>,
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Id of the most recent event that carried one.
	pub fn last_event_id(&self) -> Option<&str> {
		self.last_event_id.as_deref()
	}

	/// Latest `retry:` value seen on the stream, whether or not its event carried data.
	pub fn reconnect_delay(&self) -> Option<Duration> {
		self.reconnect_delay
	}

	pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
		self.buf.extend_from_slice(chunk);
		let mut out = Vec::new();

		while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
			let mut line = self.buf.split_to(pos + 1);
			line.truncate(pos);
			if line.last() == Some(&b'\r') {
				line.truncate(pos - 1);
			}
			let line = String::from_utf8_lossy(&line).into_owned();
			if let Some(event) = self.feed_line(&line) {
				out.push(event);
			}
		}

		// a peer that never sends a newline
		if self.buf.len() > MAX_PENDING_LINE {
			self.buf.clear();
		}
		out
	}

	fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
		if line.is_empty() {
			return self.dispatch();
		}
		if line.starts_with(':') {
			return None;
		}

		let (field, value) = match line.split_once(':') {
			Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
			None => (line, ""),
		};

		match field {
			"event" => self.event = Some(value.to_string()),
			"data" => self.data.push(value.to_string()),
			"id" if !value.contains('\0') => self.id = Some(value.to_string()),
			"retry" => {
				if let Ok(ms) = value.trim().parse::<u64>() {
					self.retry = Some(Duration::from_millis(ms));
					self.reconnect_delay = self.retry;
				}
			}
			_ => {}
		}
		None
	}

	fn dispatch(&mut self) -> Option<SseEvent> {
		let id = self.id.take();
		if id.is_some() {
			self.last_event_id.clone_from(&id);
		}
		let event = self.event.take();
		let retry = self.retry.take();
		if self.data.is_empty() {
			return None;
		}
		let data = std::mem::take(&mut self.data).join("\n");
		Some(SseEvent { event, data, id, retry })
	}
}
