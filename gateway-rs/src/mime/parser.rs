use super::types::{email_date, now, Email, File};
use super::strip_styles;
use crate::error::{GatewayError, Result};
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders, PartType};
use tracing::{debug, warn};

/// Parse raw MIME into a canonical email
///
/// `rcpt_to` is left empty; the caller sets it per delivery. Problems with
/// individual attachments are logged and never fail the parse.
pub fn parse(raw: &[u8]) -> Result<Email> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| GatewayError::Parse("unparseable MIME message".to_string()))?;

    let from = addresses(message.from()).into_iter().next().unwrap_or_default();
    let to = addresses(message.to()).join(", ");

    let date = message
        .date()
        .and_then(|date| chrono::DateTime::parse_from_rfc3339(&date.to_rfc3339()).ok())
        .map(|date| email_date(&date))
        .unwrap_or_else(now);

    let html = message
        .html_part(0)
        .and_then(|part| match &part.body {
            PartType::Html(html) => Some(strip_styles(html)),
            _ => None,
        })
        .unwrap_or_default();

    let mut files = Vec::new();
    for (position, part) in message.attachments().enumerate() {
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let name = match part.attachment_name() {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => {
                warn!("Attachment {} has no file name", position + 1);
                format!("attachment-{}", position + 1)
            }
        };

        let data = part.contents();
        if data.is_empty() {
            warn!("Attachment {} is empty, skipping", name);
            continue;
        }

        files.push(File::new(name, content_type, data.to_vec()));
    }

    let email = Email {
        message_id: message.message_id().map(bracket).unwrap_or_default(),
        in_reply_to: ids(message.in_reply_to()).into_iter().next().unwrap_or_default(),
        references: ids(message.references()).join(" "),
        date,
        from,
        to,
        rcpt_to: String::new(),
        cc: addresses(message.cc()),
        subject: message.subject().unwrap_or_default().to_string(),
        text: message
            .body_text(0)
            .map(|text| text.into_owned())
            .unwrap_or_default(),
        html,
        files,
    };

    debug!(
        "Parsed {} from {} ({} attachments)",
        email.message_id,
        email.from,
        email.files.len()
    );
    Ok(email)
}

fn addresses(address: Option<&Address>) -> Vec<String> {
    let Some(address) = address else {
        return Vec::new();
    };

    let list = match address {
        Address::List(list) => list.iter().collect::<Vec<_>>(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };

    list.into_iter()
        .filter_map(|addr| addr.address.as_deref())
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect()
}

fn ids(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(id) => vec![bracket(id)],
        HeaderValue::TextList(list) => list.iter().map(|id| bracket(id)).collect(),
        _ => Vec::new(),
    }
}

fn bracket(id: &str) -> String {
    format!("<{}>", id.trim_matches(|c| c == '<' || c == '>'))
}
