//! Builds the outgoing forward: a `multipart/alternative` message with a
//! provenance header block in front of the original body.

use lettre::message::{Mailbox, MultiPart, SinglePart};

use crate::channels::mailbox::Message;
use crate::error::DeliveryError;

/// Fixed boundary token for the alternative parts.
pub const BOUNDARY: &str = "mail-relay-boundary";

/// Prefix marking the subject of a forwarded message.
pub const SUBJECT_PREFIX: &str = "[Fwd] ";

const FORWARDED_MARKER: &str = "---------- Forwarded message ----------";
const BODY_MARKER: &str = "---------- Message body ----------";

/// Compose a forward of `message` addressed to `destination`, sent as `from`.
pub fn compose(
    message: &Message,
    destination: &str,
    from: &str,
) -> Result<lettre::Message, DeliveryError> {
    let to: Mailbox = destination
        .parse()
        .map_err(|e| DeliveryError::Compose(format!("Invalid destination {destination}: {e}")))?;
    let from: Mailbox = from
        .parse()
        .map_err(|e| DeliveryError::Compose(format!("Invalid from address {from}: {e}")))?;

    let mut body = MultiPart::alternative()
        .boundary(BOUNDARY)
        .singlepart(SinglePart::plain(plain_part(message)));
    if let Some(html) = message.html.as_deref() {
        body = body.singlepart(SinglePart::html(html_part(message, html)));
    }

    lettre::Message::builder()
        .from(from)
        .to(to)
        .subject(format!("{SUBJECT_PREFIX}{}", message.subject))
        .multipart(body)
        .map_err(|e| DeliveryError::Compose(format!("Failed to build forward: {e}")))
}

fn plain_part(message: &Message) -> String {
    format!(
        "{FORWARDED_MARKER}\r\n\
         From: {}\r\n\
         Subject: {}\r\n\
         To: {}\r\n\
         {BODY_MARKER}\r\n\r\n\
         {}\r\n",
        message.sender_display(),
        message.subject,
        message.to,
        message.text_or_placeholder(),
    )
}

fn html_part(message: &Message, html: &str) -> String {
    format!(
        "<div style=\"border-left: 3px solid #ccc; padding-left: 10px; margin: 10px 0;\">\r\n\
         <h4>{FORWARDED_MARKER}</h4>\r\n\
         <p><strong>From:</strong> {}</p>\r\n\
         <p><strong>Subject:</strong> {}</p>\r\n\
         <p><strong>To:</strong> {}</p>\r\n\
         <h4>{BODY_MARKER}</h4>\r\n\
         {html}\r\n</div>\r\n",
        escape_html(&message.sender_display()),
        escape_html(&message.subject),
        escape_html(&message.to),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::mailbox::NO_PLAINTEXT_PLACEHOLDER;

    fn sample() -> Message {
        Message::new("m1", "invoices - ap@example.com", "alice@example.com")
            .with_sender_name("Alice")
            .with_to("relay@example.com")
            .with_text("Please pay invoice 42.")
    }

    fn render(msg: &lettre::Message) -> String {
        String::from_utf8(msg.formatted()).unwrap()
    }

    #[test]
    fn headers_and_provenance() {
        let out = render(&compose(&sample(), "ap@example.com", "relay@example.com").unwrap());
        assert!(out.contains("To: ap@example.com"));
        assert!(out.contains("From: relay@example.com"));
        assert!(out.contains("Subject: [Fwd] invoices - ap@example.com"));
        assert!(out.contains("MIME-Version: 1.0"));
        assert!(out.contains("multipart/alternative"));
        assert!(out.contains(BOUNDARY));
        assert!(out.contains(FORWARDED_MARKER));
        assert!(out.contains("From: Alice <alice@example.com>"));
        assert!(out.contains("To: relay@example.com"));
        assert!(out.contains("Please pay invoice 42."));
    }

    #[test]
    fn plaintext_only_has_single_part() {
        let out = render(&compose(&sample(), "ap@example.com", "relay@example.com").unwrap());
        assert!(out.contains("text/plain"));
        assert!(!out.contains("text/html"));
    }

    #[test]
    fn html_part_added_when_present() {
        let msg = sample().with_html("<p>Pay me</p>");
        let out = render(&compose(&msg, "ap@example.com", "relay@example.com").unwrap());
        assert!(out.contains("text/html"));
        assert!(out.contains("<p>Pay me</p>"));
        assert!(out.contains("Alice &lt;alice@example.com&gt;"));
    }

    #[test]
    fn missing_plaintext_uses_placeholder() {
        let msg = Message::new("m2", "receipts - books@example.com", "bob@example.com")
            .with_html("<b>markup only</b>");
        let out = render(&compose(&msg, "books@example.com", "relay@example.com").unwrap());
        assert!(out.contains(NO_PLAINTEXT_PLACEHOLDER));
    }

    #[test]
    fn invalid_destination_is_compose_error() {
        let err = compose(&sample(), "not an address", "relay@example.com").unwrap_err();
        assert!(matches!(err, DeliveryError::Compose(_)));
    }

    #[test]
    fn escape_html_specials() {
        assert_eq!(escape_html(r#"<a href="x">&</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}
