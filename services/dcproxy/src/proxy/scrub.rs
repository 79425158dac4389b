//! Stream rewriting of address tokens.
//!
//! NMDC clients announce their address with `$MyIP <addr> ...|`. When the
//! proxy runs with `no_send_ip`, the address after the prefix is replaced
//! with a placeholder before bytes reach the hub. The client stream arrives in
//! arbitrary chunks, so a token may be split anywhere, including inside the
//! prefix. The scrubber is a byte-level state machine whose state between
//! chunks is an explicit [`Carry`]; the output for a stream is identical no
//! matter how it was chunked.

use std::net::IpAddr;

use crate::error::ProxyError;

/// Prefix of the NMDC address announcement.
pub const NMDC_MY_IP_PREFIX: &[u8] = b"$MyIP ";

/// Address written in place of a scrubbed one.
pub const DEFAULT_PLACEHOLDER: &[u8] = b"0.0.0.0";

/// Longest textual IPv6 address (with an embedded IPv4 tail).
pub const MAX_ADDRESS_LEN: usize = 45;

/// What to look for and what to write instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubRule {
    prefix: Vec<u8>,
    placeholder: Vec<u8>,
    max_value: usize,
    /// KMP failure table for `prefix`.
    failure: Vec<usize>,
}

impl ScrubRule {
    /// Build a rule. The prefix must be non-empty and `max_value` positive.
    pub fn new(
        prefix: impl Into<Vec<u8>>,
        placeholder: impl Into<Vec<u8>>,
        max_value: usize,
    ) -> Result<Self, ProxyError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(ProxyError::Config("scrub prefix must not be empty".to_string()));
        }
        if max_value == 0 {
            return Err(ProxyError::Config(
                "scrub value limit must be positive".to_string(),
            ));
        }

        let failure = failure_table(&prefix);
        Ok(Self {
            prefix,
            placeholder: placeholder.into(),
            max_value,
            failure,
        })
    }

    /// The `$MyIP ` rule with a `0.0.0.0` placeholder.
    pub fn nmdc_my_ip() -> Self {
        Self {
            prefix: NMDC_MY_IP_PREFIX.to_vec(),
            placeholder: DEFAULT_PLACEHOLDER.to_vec(),
            max_value: MAX_ADDRESS_LEN,
            failure: failure_table(NMDC_MY_IP_PREFIX),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn placeholder(&self) -> &[u8] {
        &self.placeholder
    }
}

fn failure_table(prefix: &[u8]) -> Vec<usize> {
    let mut failure = vec![0; prefix.len()];
    let mut k = 0;
    for i in 1..prefix.len() {
        while k > 0 && prefix[i] != prefix[k] {
            k = failure[k - 1];
        }
        if prefix[i] == prefix[k] {
            k += 1;
        }
        failure[i] = k;
    }
    failure
}

/// Scrubber state carried between chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Carry {
    /// The last `k` bytes seen match the first `k` bytes of the prefix and
    /// have not been emitted yet.
    Scanning(usize),
    /// The prefix was emitted; these value bytes are held back.
    Value(Vec<u8>),
}

impl Default for Carry {
    fn default() -> Self {
        Carry::Scanning(0)
    }
}

impl Carry {
    /// Whether any bytes are held back.
    pub fn is_pending(&self) -> bool {
        !matches!(self, Carry::Scanning(0))
    }
}

/// Result of filtering one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scrubbed {
    pub output: Vec<u8>,
    pub carry: Carry,
    /// Number of values replaced in this chunk.
    pub replaced: u64,
}

/// Rewrites address values following a prefix.
#[derive(Debug, Clone)]
pub struct ProtocolScrubber {
    rule: ScrubRule,
}

impl Default for ProtocolScrubber {
    fn default() -> Self {
        Self::new(ScrubRule::nmdc_my_ip())
    }
}

impl ProtocolScrubber {
    pub fn new(rule: ScrubRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> &ScrubRule {
        &self.rule
    }

    /// Filter one chunk, continuing from `carry`.
    pub fn filter(&self, chunk: &[u8], carry: Carry) -> Scrubbed {
        let mut output = Vec::with_capacity(chunk.len() + self.rule.placeholder.len());
        let mut replaced = 0;
        let mut state = carry;
        let first = self.rule.prefix[0];

        let mut i = 0;
        while i < chunk.len() {
            if state == Carry::Scanning(0) {
                // Nothing held back: copy straight up to the next prefix start.
                match chunk[i..].iter().position(|&b| b == first) {
                    Some(offset) => {
                        output.extend_from_slice(&chunk[i..i + offset]);
                        i += offset;
                    }
                    None => {
                        output.extend_from_slice(&chunk[i..]);
                        break;
                    }
                }
            }

            let (next, consumed) = self.step(state, chunk[i], &mut output, &mut replaced);
            state = next;
            if consumed {
                i += 1;
            }
        }

        Scrubbed {
            output,
            carry: state,
            replaced,
        }
    }

    /// Flush held-back bytes unmodified at end of stream.
    pub fn finish(&self, carry: Carry) -> Vec<u8> {
        match carry {
            Carry::Scanning(k) => self.rule.prefix[..k].to_vec(),
            Carry::Value(value) => value,
        }
    }

    /// Advance by one byte. Returns the next state and whether the byte was
    /// consumed; a byte that terminates a value is fed again in `Scanning(0)`.
    fn step(
        &self,
        state: Carry,
        byte: u8,
        output: &mut Vec<u8>,
        replaced: &mut u64,
    ) -> (Carry, bool) {
        match state {
            Carry::Scanning(held) => {
                let prefix = &self.rule.prefix;
                let mut k = held;
                while k > 0 && prefix[k] != byte {
                    k = self.rule.failure[k - 1];
                }
                if prefix[k] == byte {
                    k += 1;
                }

                // Held bytes plus this one, minus what is still a prefix match.
                let released = held + 1 - k;
                if released > 0 {
                    let from_prefix = released.min(held);
                    output.extend_from_slice(&prefix[..from_prefix]);
                    if released > held {
                        output.push(byte);
                    }
                }

                if k == prefix.len() {
                    output.extend_from_slice(prefix);
                    (Carry::Value(Vec::new()), true)
                } else {
                    (Carry::Scanning(k), true)
                }
            }
            Carry::Value(mut value) => {
                if is_address_byte(byte) {
                    if value.len() < self.rule.max_value {
                        value.push(byte);
                        return (Carry::Value(value), true);
                    }
                    // Too long to be an address.
                    output.extend_from_slice(&value);
                    return (Carry::Scanning(0), false);
                }

                if is_address(&value) {
                    output.extend_from_slice(&self.rule.placeholder);
                    *replaced += 1;
                } else {
                    output.extend_from_slice(&value);
                }
                (Carry::Scanning(0), false)
            }
        }
    }
}

fn is_address_byte(byte: u8) -> bool {
    byte.is_ascii_hexdigit() || byte == b'.' || byte == b':'
}

fn is_address(value: &[u8]) -> bool {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<IpAddr>().ok())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scrub_chunks(scrubber: &ProtocolScrubber, chunks: &[&[u8]]) -> (Vec<u8>, u64) {
        let mut out = Vec::new();
        let mut carry = Carry::default();
        let mut replaced = 0;
        for chunk in chunks {
            let result = scrubber.filter(chunk, carry);
            out.extend_from_slice(&result.output);
            carry = result.carry;
            replaced += result.replaced;
        }
        out.extend_from_slice(&scrubber.finish(carry));
        (out, replaced)
    }

    fn scrub(input: &[u8]) -> Vec<u8> {
        scrub_chunks(&ProtocolScrubber::default(), &[input]).0
    }

    #[test]
    fn test_replaces_ipv4() {
        assert_eq!(scrub(b"$MyIP 10.0.0.5|"), b"$MyIP 0.0.0.0|".to_vec());
        assert_eq!(
            scrub(b"$Key x|$MyIP 192.168.1.20 0.0|$Supports|"),
            b"$Key x|$MyIP 0.0.0.0 0.0|$Supports|".to_vec()
        );
    }

    #[test]
    fn test_replaces_ipv6() {
        assert_eq!(scrub(b"$MyIP fe80::1|"), b"$MyIP 0.0.0.0|".to_vec());
        assert_eq!(
            scrub(b"$MyIP ::ffff:10.1.2.3 1.3|"),
            b"$MyIP 0.0.0.0 1.3|".to_vec()
        );
    }

    #[test]
    fn test_non_address_values_unchanged() {
        assert_eq!(scrub(b"$MyIP cafe|"), b"$MyIP cafe|".to_vec());
        assert_eq!(scrub(b"$MyIP |"), b"$MyIP |".to_vec());
        assert_eq!(scrub(b"$MyIP 1.2.3.4:411|"), b"$MyIP 1.2.3.4:411|".to_vec());
        assert_eq!(scrub(b"$MyIPX 1.2.3.4|"), b"$MyIPX 1.2.3.4|".to_vec());
    }

    #[test]
    fn test_partial_prefix_restarts_match() {
        assert_eq!(
            scrub(b"$My$MyIP 10.0.0.5|"),
            b"$My$MyIP 0.0.0.0|".to_vec()
        );
        assert_eq!(scrub(b"$$$MyIP 1.1.1.1|"), b"$$$MyIP 0.0.0.0|".to_vec());
    }

    #[test]
    fn test_overlong_value_unchanged() {
        let mut input = b"$MyIP ".to_vec();
        input.extend(std::iter::repeat(b'1').take(MAX_ADDRESS_LEN + 10));
        input.push(b'|');
        assert_eq!(scrub(&input), input);
    }

    #[test]
    fn test_finish_flushes_carry_unmodified() {
        let scrubber = ProtocolScrubber::default();

        let partial = scrubber.filter(b"hello $MyI", Carry::default());
        assert_eq!(partial.output, b"hello ".to_vec());
        assert_eq!(partial.carry, Carry::Scanning(4));
        assert_eq!(scrubber.finish(partial.carry), b"$MyI".to_vec());

        let value = scrubber.filter(b"$MyIP 10.0.0.5", Carry::default());
        assert_eq!(value.output, b"$MyIP ".to_vec());
        assert!(value.carry.is_pending());
        assert_eq!(scrubber.finish(value.carry), b"10.0.0.5".to_vec());
    }

    #[test]
    fn test_counts_replacements() {
        let (_, replaced) = scrub_chunks(
            &ProtocolScrubber::default(),
            &[b"$MyIP 1.2.3.4|$MyIP nope|$MyIP ::1|"],
        );
        assert_eq!(replaced, 2);
    }

    #[test]
    fn test_custom_rule() {
        let rule = ScrubRule::new(b"ip=".to_vec(), b"x".to_vec(), 16).unwrap();
        let scrubber = ProtocolScrubber::new(rule);
        let (out, replaced) = scrub_chunks(&scrubber, &[b"a ip=1.2.3.4&ip=zz"]);
        assert_eq!(out, b"a ip=x&ip=zz".to_vec());
        assert_eq!(replaced, 1);
    }

    #[test]
    fn test_rule_rejects_empty_prefix() {
        assert!(ScrubRule::new(Vec::new(), b"x".to_vec(), 4).is_err());
        assert!(ScrubRule::new(b"a".to_vec(), b"x".to_vec(), 0).is_err());
    }

    #[test]
    fn test_every_split_point_gives_same_output() {
        let scrubber = ProtocolScrubber::default();
        let inputs: &[&[u8]] = &[
            b"$MyIP 10.0.0.5|",
            b"$My$MyIP 10.0.0.5 1.2|$MyIP ::1|tail",
            b"$$MyIP fe80::1%eth0|$MyIP",
            b"$MyIP 1.2.3.4$MyIP 5.6.7.8|",
        ];

        for input in inputs {
            let expected = scrub_chunks(&scrubber, &[input]);
            for i in 0..=input.len() {
                for j in i..=input.len() {
                    let got = scrub_chunks(&scrubber, &[&input[..i], &input[i..j], &input[j..]]);
                    assert_eq!(
                        got,
                        expected,
                        "split at {i},{j} of {:?}",
                        String::from_utf8_lossy(input)
                    );
                }
            }
        }
    }

    fn token() -> impl Strategy<Value = Vec<u8>> {
        prop_oneof![
            Just(b"$MyIP ".to_vec()),
            Just(b"$My".to_vec()),
            Just(b"10.0.0.5".to_vec()),
            Just(b"::1".to_vec()),
            Just(b"|".to_vec()),
            Just(b" ".to_vec()),
            proptest::collection::vec(any::<u8>(), 0..8),
        ]
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(
            tokens in proptest::collection::vec(token(), 0..24),
            cuts in proptest::collection::vec(1usize..7, 1..16),
        ) {
            let input: Vec<u8> = tokens.concat();
            let scrubber = ProtocolScrubber::default();
            let expected = scrub_chunks(&scrubber, &[&input]);

            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut rest = input.as_slice();
            for cut in cuts.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let (head, tail) = rest.split_at((*cut).min(rest.len()));
                chunks.push(head);
                rest = tail;
            }

            prop_assert_eq!(scrub_chunks(&scrubber, &chunks), expected);
        }

        #[test]
        fn prop_streams_without_prefix_pass_through(
            input in proptest::collection::vec(
                any::<u8>().prop_filter("no $", |b| *b != b'$'),
                0..256,
            ),
        ) {
            prop_assert_eq!(scrub(&input), input);
        }
    }
}
