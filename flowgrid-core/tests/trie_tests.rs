//! Longest-prefix match over the Patricia trie

use std::net::Ipv4Addr;

use flowgrid_core::{PatriciaTrie, Prefix};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn p(s: &str) -> Prefix {
    s.parse().unwrap()
}

#[test]
fn test_longest_prefix_wins() {
    let trie = PatriciaTrie::new(32);
    trie.put(p("10.0.0.0/8"), "A").unwrap();
    trie.put(p("10.1.0.0/16"), "B").unwrap();
    trie.put(p("10.1.2.0/24"), "C").unwrap();

    assert_eq!(trie.match_prefix(&p("10.1.2.3/32")).unwrap(), Some("C"));
    assert_eq!(trie.match_prefix(&p("10.1.3.3/32")).unwrap(), Some("B"));
    assert_eq!(trie.match_prefix(&p("10.2.0.1/32")).unwrap(), Some("A"));
    assert_eq!(trie.match_prefix(&p("11.0.0.0/8")).unwrap(), None);
}

#[test]
fn test_removing_more_specific_falls_back() {
    let trie = PatriciaTrie::new(32);
    trie.put(p("10.0.0.0/8"), "A").unwrap();
    trie.put(p("10.1.0.0/16"), "B").unwrap();
    assert!(trie.remove(&p("10.1.0.0/16"), &"B"));
    assert_eq!(trie.match_prefix(&p("10.1.2.3")).unwrap(), Some("A"));
    assert!(!trie.remove(&p("10.1.0.0/16"), &"B"));
}

#[test]
fn test_ipv6_prefixes() {
    let trie = PatriciaTrie::new(128);
    trie.put(p("2001:db8::/32"), 1).unwrap();
    trie.put(p("2001:db8:1::/48"), 2).unwrap();
    assert_eq!(trie.match_prefix(&p("2001:db8:1::5")).unwrap(), Some(2));
    assert_eq!(trie.match_prefix(&p("2001:db8:2::5")).unwrap(), Some(1));
    assert_eq!(trie.match_prefix(&p("2001:db9::1")).unwrap(), None);
}

fn route() -> impl Strategy<Value = (u32, usize)> {
    (any::<u32>(), 0usize..=32).prop_map(|(addr, len)| {
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        (addr & mask, len)
    })
}

fn prefix(addr: u32, len: usize) -> Prefix {
    Prefix::new(Ipv4Addr::from(addr).octets().to_vec(), len).unwrap()
}

fn covers(route: (u32, usize), addr: u32) -> bool {
    let (net, len) = route;
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    addr & mask == net
}

proptest! {
    #[test]
    fn prop_match_agrees_with_linear_scan(
        routes in prop::collection::btree_map(route(), any::<u16>(), 0..40),
        queries in prop::collection::vec(any::<u32>(), 1..20),
    ) {
        let trie = PatriciaTrie::new(32);
        for ((addr, len), value) in &routes {
            trie.put(prefix(*addr, *len), *value).unwrap();
        }
        prop_assert_eq!(trie.len(), routes.len());

        for query in queries {
            let expected = routes
                .iter()
                .filter(|(r, _)| covers(**r, query))
                .max_by_key(|((_, len), _)| *len)
                .map(|(_, v)| *v);
            prop_assert_eq!(trie.match_prefix(&prefix(query, 32)).unwrap(), expected);
        }
    }

    #[test]
    fn prop_exact_lookup_after_removals(
        routes in prop::collection::btree_map(route(), any::<u16>(), 1..30),
        remove_mask in prop::collection::vec(any::<bool>(), 30),
    ) {
        let trie = PatriciaTrie::new(32);
        for ((addr, len), value) in &routes {
            trie.put(prefix(*addr, *len), *value).unwrap();
        }
        let mut kept = Vec::new();
        for (((addr, len), value), remove) in routes.iter().zip(remove_mask) {
            if remove {
                prop_assert!(trie.remove(&prefix(*addr, *len), value));
            } else {
                kept.push(((*addr, *len), *value));
            }
        }
        prop_assert_eq!(trie.len(), kept.len());
        for ((addr, len), value) in kept {
            prop_assert_eq!(trie.lookup(&prefix(addr, len)).unwrap(), Some(value));
        }
    }
}
