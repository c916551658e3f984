//! End-to-end pipeline tests: config document on disk → expanded
//! descriptors → assembled messages → rendered output.

use std::fs;
use std::path::Path;

use mailspool_core::document::Document;
use mailspool_core::message::Message;

fn load(dir: &Path, name: &str, contents: &str) -> Document {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    Document::load_path(&path).unwrap()
}

fn build(document: &Document, index: usize, base_dir: &Path) -> Message {
    let mail = document.mails[index].clone();
    let attachments: Vec<String> = mail
        .attachments
        .as_ref()
        .map(|field| field.raw_items())
        .unwrap_or_default();

    let mut msg = Message::from_descriptor(mail, base_dir, document.expander()).unwrap();
    for attachment in attachments {
        msg.attach(base_dir.join(attachment));
    }
    msg.message_id = Some("<fixed@example.org>".into());
    msg
}

#[test]
fn simple_text_message_renders() {
    let dir = tempfile::tempdir().unwrap();
    let document = load(
        dir.path(),
        "simple.yml",
        concat!(
            "---\n",
            "mails:\n",
            "  - name: simple\n",
            "    description: A simple text message\n",
            "    sender: sender@example.org\n",
            "    recipients: recipient@example.org\n",
            "    subject: Simple Text Message\n",
            "    text_body: |\n",
            "        Just a simple text message.\n",
        ),
    );

    assert_eq!(document.mails.len(), 1);
    let rendered = build(&document, 0, dir.path()).render().unwrap();

    assert!(rendered.contains("From: sender@example.org\r\n"));
    assert!(rendered.contains("To: recipient@example.org\r\n"));
    assert!(rendered.contains("Subject: Simple Text Message\r\n"));
    assert!(rendered.contains("Just a simple text message."));
}

#[test]
fn vars_and_defaults_feed_every_mail() {
    let dir = tempfile::tempdir().unwrap();
    let document = load(
        dir.path(),
        "with_vars.yml",
        concat!(
            "---\n",
            "defaults:\n",
            "  sender: sender@example.org\n",
            "vars:\n",
            "  subject: Quarterly Report\n",
            "mails:\n",
            "  - name: first\n",
            "    recipients: one@example.org\n",
            "    subject: '{{ subject }}'\n",
            "  - name: second\n",
            "    recipients: two@example.org\n",
            "    subject: '{{ subject }} (copy)'\n",
        ),
    );

    assert_eq!(document.mails.len(), 2);
    assert_eq!(document.mails[0].sender.as_deref(), Some("sender@example.org"));
    assert_eq!(document.mails[0].subject.as_deref(), Some("Quarterly Report"));
    assert_eq!(
        document.mails[1].subject.as_deref(),
        Some("Quarterly Report (copy)")
    );
}

#[test]
fn loop_expansion_renders_each_binding() {
    let dir = tempfile::tempdir().unwrap();
    let document = load(
        dir.path(),
        "looped.yml",
        concat!(
            "mails:\n",
            "  - name: 'welcome-{{ item.user }}'\n",
            "    sender: noreply@example.org\n",
            "    recipients: '{{ item.user }}@example.org'\n",
            "    subject: 'Welcome, {{ item.name }}!'\n",
            "    text_body: 'Hello {{ item.name }}'\n",
            "    loop:\n",
            "      - { user: alice, name: Alice }\n",
            "      - { user: bob, name: Bob }\n",
        ),
    );

    assert_eq!(document.mails.len(), 2);
    assert_eq!(document.mails[0].name.as_deref(), Some("welcome-alice"));
    assert_eq!(document.mails[1].name.as_deref(), Some("welcome-bob"));

    let rendered = build(&document, 1, dir.path()).render().unwrap();
    assert!(rendered.contains("To: bob@example.org\r\n"));
    assert!(rendered.contains("Subject: Welcome, Bob!\r\n"));
    assert!(rendered.contains("Hello Bob"));
}

#[test]
fn attachments_resolve_relative_to_the_config_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), b"meeting notes").unwrap();

    let document = load(
        dir.path(),
        "attached.yml",
        concat!(
            "mails:\n",
            "  - name: attached\n",
            "    sender: sender@example.org\n",
            "    recipients: recipient@example.org\n",
            "    subject: With attachment\n",
            "    text_body: See attached.\n",
            "    attachments: notes.txt\n",
        ),
    );

    let rendered = build(&document, 0, dir.path()).render().unwrap();
    assert!(rendered.contains("multipart/mixed"));
    assert!(rendered.contains("attachment; filename=\"notes.txt\""));
}

#[test]
fn raw_message_template_is_rendered_and_reparsed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("alert.eml"),
        "X-Alert-Level: {{ level }}\nContent-Type: text/plain\n\nStatus is {{ level }}.\n",
    )
    .unwrap();

    let document = load(
        dir.path(),
        "raw.yml",
        concat!(
            "vars:\n",
            "  level: critical\n",
            "mails:\n",
            "  - name: raw\n",
            "    sender: alerts@example.org\n",
            "    recipients: ops@example.org\n",
            "    subject: Alert\n",
            "    eml: alert.eml\n",
        ),
    );

    let rendered = build(&document, 0, dir.path()).render().unwrap();
    assert!(rendered.contains("X-Alert-Level: critical\r\n"));
    assert!(rendered.contains("Status is critical."));
    assert!(rendered.contains("From: alerts@example.org\r\n"));
}

#[test]
fn sibling_files_are_independent() {
    let dir = tempfile::tempdir().unwrap();

    // the broken file fails on its own
    let broken = dir.path().join("broken.yml");
    fs::write(&broken, "mails:\n  - subject: No sender or recipients\n").unwrap();
    assert!(Document::load_path(&broken).is_err());

    // a valid sibling still loads
    let document = load(
        dir.path(),
        "valid.yml",
        concat!(
            "mails:\n",
            "  - sender: sender@example.org\n",
            "    recipients: recipient@example.org\n",
        ),
    );
    assert_eq!(document.mails.len(), 1);
}
