use meshping::bot::split_message;

fn assert_split_ok(text: &str, max: usize) {
    let chunks = split_message(text, max);
    if text.len() <= max {
        assert_eq!(chunks, vec![text.to_string()]);
        return;
    }
    assert!(!chunks.is_empty());
    for c in &chunks {
        assert!(c.len() <= max, "chunk {:?} longer than {}", c, max);
        assert!(!c.is_empty());
    }
    // Re-joining gives back the text with whitespace runs at the cuts collapsed.
    let joined = chunks.join(" ");
    let squash = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
    assert_eq!(squash(&joined), squash(text));
}

#[test]
fn chunks_respect_limit_for_many_widths() {
    let text = "Meshtastic Pingbot Help: I respond to ping, hello and test. \
                Traceroute is rate limited! Want more? Send 'ping 3' for three replies. \
                Long-range LoRa links are slow, so keep messages short.";
    for max in [16, 20, 33, 50, 64, 100, 199, 200] {
        assert_split_ok(text, max);
    }
}

#[test]
fn join_reproduces_plain_text() {
    let text = "one two three four five six seven eight nine ten eleven twelve";
    let chunks = split_message(text, 16);
    assert_eq!(chunks.join(" "), text);
}

#[test]
fn multibyte_text_never_splits_a_char() {
    let text = "Grüße aus Köln! Signal ist gut. Ünïcödé überall, ñandú y pingüino. 📡📡📡📡📡📡";
    for max in [16, 17, 18, 25, 40] {
        let chunks = split_message(text, max);
        for c in &chunks {
            assert!(c.len() <= max);
            assert!(std::str::from_utf8(c.as_bytes()).is_ok());
        }
    }
}

#[test]
fn text_at_the_limit_is_untouched() {
    let text = "x".repeat(200);
    assert_eq!(split_message(&text, 200), vec![text.clone()]);
    let over = "x".repeat(201);
    let chunks = split_message(&over, 200);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].len(), 200);
    assert_eq!(chunks[1], "x");
}
