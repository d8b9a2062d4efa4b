use super::dkim::DkimKey;
use super::types::Email;
use crate::utils::hostname;
use mail_builder::headers::address::Address;
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use tracing::{error, warn};

/// Build the MIME message for an email without signing it
///
/// Returns `None` when the email has neither text nor HTML.
pub fn compose_unsigned(email: &Email) -> Option<Vec<u8>> {
    if !email.has_body() {
        warn!("Refusing to compose {} without a body", email.message_id);
        return None;
    }

    let date = if email.date.is_empty() {
        super::types::now()
    } else {
        email.date.clone()
    };

    let mut builder = MessageBuilder::new()
        .from(Address::new_address(None::<&str>, email.from.as_str()))
        .to(recipients(&[email.to.as_str()]))
        .subject(email.subject.as_str())
        .header("Date", Raw::new(date));

    if !email.cc.is_empty() {
        let cc: Vec<&str> = email.cc.iter().map(String::as_str).collect();
        builder = builder.cc(recipients(&cc));
    }
    if !email.message_id.is_empty() {
        builder = builder.header("Message-ID", Raw::new(email.message_id.as_str()));
    }
    if !email.in_reply_to.is_empty() {
        builder = builder.header("In-Reply-To", Raw::new(email.in_reply_to.as_str()));
    }
    if !email.references.is_empty() {
        builder = builder.header("References", Raw::new(email.references.as_str()));
    }
    if !email.text.is_empty() {
        builder = builder.text_body(email.text.as_str());
    }
    if !email.html.is_empty() {
        builder = builder.html_body(email.html.as_str());
    }
    for file in &email.files {
        builder = builder.attachment(
            file.content_type.as_str(),
            file.name.as_str(),
            file.data.as_slice(),
        );
    }

    match builder.write_to_vec() {
        Ok(raw) => Some(raw),
        Err(e) => {
            error!("Cannot compose {}: {}", email.message_id, e);
            None
        }
    }
}

/// Build the MIME message and DKIM-sign it when a key is configured
///
/// The signing domain is the sender's. A signing failure yields the
/// unsigned message.
pub fn compose(email: &Email, key: Option<&DkimKey>) -> Option<Vec<u8>> {
    let unsigned = compose_unsigned(email)?;

    let (Some(key), Some(domain)) = (key, hostname(&email.from)) else {
        return Some(unsigned);
    };

    match key.sign(&unsigned, &domain) {
        Ok(signed) => Some(signed),
        Err(e) => {
            warn!("DKIM signing failed for {}, sending unsigned: {}", email.message_id, e);
            Some(unsigned)
        }
    }
}

fn recipients<'x>(addresses: &[&'x str]) -> Address<'x> {
    let list: Vec<Address<'x>> = addresses
        .iter()
        .flat_map(|field| field.split(','))
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(|addr| Address::new_address(None::<&str>, addr))
        .collect();

    if list.len() == 1 {
        list.into_iter().next().unwrap_or_else(|| Address::new_list(Vec::new()))
    } else {
        Address::new_list(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{parse, File};

    fn sample() -> Email {
        Email {
            message_id: "<$event@ourdomain.test>".to_string(),
            date: "Tue, 05 Mar 2024 07:08:09 +0000".to_string(),
            from: "alice@ourdomain.test".to_string(),
            to: "bob@external.test".to_string(),
            rcpt_to: "bob@external.test".to_string(),
            subject: "Status".to_string(),
            text: "All good".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_body_yields_nothing() {
        let mut email = sample();
        email.text.clear();
        assert!(compose_unsigned(&email).is_none());
        assert!(compose(&email, None).is_none());
    }

    #[test]
    fn test_headers_written() {
        let email = sample().with_reply("<root@x.test>", "<first@x.test> <root@x.test>");
        let raw = String::from_utf8(compose_unsigned(&email).unwrap()).unwrap();

        assert!(raw.contains("Message-ID: <$event@ourdomain.test>\r\n"));
        assert!(raw.contains("In-Reply-To: <root@x.test>\r\n"));
        assert!(raw.contains("References: <first@x.test> <root@x.test>\r\n"));
        assert!(raw.contains("Date: Tue, 05 Mar 2024 07:08:09 +0000\r\n"));
        assert!(raw.contains("Subject: Status"));
    }

    #[test]
    fn test_compose_then_parse_keeps_fields() {
        let mut email = sample().with_html("<p>All <b>good</b></p>");
        email.cc = vec!["carol@external.test".to_string()];
        email.files = vec![File::new("notes.txt", "text/plain", b"some notes".to_vec())];

        let parsed = parse(&compose(&email, None).unwrap()).unwrap();

        assert_eq!(parsed.from, email.from);
        assert_eq!(parsed.to, email.to);
        assert_eq!(parsed.cc, email.cc);
        assert_eq!(parsed.subject, email.subject);
        assert_eq!(parsed.text.trim(), email.text);
        assert_eq!(parsed.html.trim(), email.html);
        assert_eq!(parsed.message_id, email.message_id);
        assert_eq!(parsed.date, email.date);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].name, "notes.txt");
        assert_eq!(parsed.files[0].data, b"some notes".to_vec());
    }

    #[test]
    fn test_parse_then_compose_round_trip() {
        let raw = b"From: sender@example.com\r\n\
To: sales@ourdomain.test\r\n\
Subject: Round trip\r\n\
Message-ID: <rt@example.com>\r\n\
\r\n\
Just text\r\n";

        let first = parse(raw).unwrap();
        let second = parse(&compose_unsigned(&first).unwrap()).unwrap();

        assert_eq!(second.from, first.from);
        assert_eq!(second.to, first.to);
        assert_eq!(second.subject, first.subject);
        assert_eq!(second.text.trim(), first.text.trim());
        assert_eq!(second.message_id, first.message_id);
    }
}
