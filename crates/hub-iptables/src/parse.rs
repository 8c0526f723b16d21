//! Parsing of `iptables -S` output
//!
//! ```text
//! -P FORWARD ACCEPT
//! -N hub-main
//! -A FORWARD -s 100.7.192.0/18 -j hub-main
//! -A hub-policy -d 100.7.224.2/32 -m comment --comment hub-policy-3 -j hub-rule-1
//! ```
//!
//! Only the matches the hub emits are understood. Lines carrying any
//! other match (interfaces, negations, foreign modules) are skipped, so
//! they can never be mistaken for a hub entry.

use hub_core::model::Protocol;
use hub_core::traits::{FilterEntry, Target};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Split a line into words, honouring double quotes
pub fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// User-defined chain names declared in a full `-S` listing
pub fn parse_chains(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.strip_prefix("-N "))
        .map(|name| name.trim().to_string())
        .collect()
}

/// Entries of `chain` in a `-S <chain>` listing, in order
pub fn parse_entries(listing: &str, chain: &str) -> Vec<FilterEntry> {
    listing
        .lines()
        .filter_map(|line| {
            let words = split_words(line);
            match words.as_slice() {
                [op, name, rest @ ..] if op == "-A" && name == chain => {
                    let entry = parse_rule(rest);
                    if entry.is_none() {
                        tracing::debug!("Ignoring foreign entry in {}: {}", chain, line);
                    }
                    entry
                }
                _ => None,
            }
        })
        .collect()
}

/// Parse a rule specification (everything after `-A <chain>`)
pub fn parse_rule(words: &[String]) -> Option<FilterEntry> {
    let mut entry = FilterEntry::new(Target::Accept);
    let mut target = None;
    let mut iter = words.iter().map(String::as_str);

    while let Some(word) = iter.next() {
        match word {
            "-s" => entry.source = Some(parse_net(iter.next()?)?),
            "-d" => entry.destination = Some(parse_net(iter.next()?)?),
            "-p" => {
                entry.protocol = Some(match iter.next()? {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    "icmp" => Protocol::Icmp,
                    _ => return None,
                })
            }
            "-m" => match iter.next()? {
                "multiport" | "conntrack" | "comment" => {}
                // implicit protocol module, e.g. `-p tcp -m tcp`
                "tcp" | "udp" | "icmp" => {}
                _ => return None,
            },
            "--dports" => entry.dports = Some(iter.next()?.to_string()),
            "--ctstate" => entry.ctstate = Some(iter.next()?.to_string()),
            "--comment" => entry.comment = Some(iter.next()?.to_string()),
            "-j" => target = Some(Target::parse(iter.next()?)),
            _ => return None,
        }
    }

    entry.target = target?;
    Some(entry)
}

/// iptables prints host addresses without a prefix length in some versions
fn parse_net(word: &str) -> Option<Ipv4Net> {
    Ipv4Net::from_str(word)
        .ok()
        .or_else(|| Ipv4Addr::from_str(word).ok().map(Ipv4Net::from))
}
