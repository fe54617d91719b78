//! Longest-prefix-match index
//!
//! A binary patricia trie over prefixes read most-significant bit first.
//! Nodes live in an arena and refer to each other by index. Where two keys
//! diverge an aggregate node without a value is inserted at their common
//! prefix; aggregates never answer a lookup.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{FlowgridError, FlowgridResult};

/// Address bits plus a prefix length; bits past the length are zero
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Prefix {
    address: Vec<u8>,
    len: usize,
}

impl Prefix {
    pub fn new(address: impl Into<Vec<u8>>, len: usize) -> FlowgridResult<Self> {
        let address = address.into();
        let bits = address.len() * 8;
        if len > bits {
            return Err(FlowgridError::invalid_input(
                "prefix",
                format!("length {} exceeds the {}-bit address", len, bits),
            ));
        }
        Ok(Self { address, len: bits }.truncated(len))
    }

    pub fn address(&self) -> &[u8] {
        &self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The zero-length prefix matches everything
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bit(&self, index: usize) -> bool {
        match self.address.get(index / 8) {
            Some(byte) => (byte >> (7 - index % 8)) & 1 == 1,
            None => false,
        }
    }

    /// Number of leading bits shared with `other`, at most the shorter length
    fn common_len(&self, other: &Prefix) -> usize {
        let limit = self.len.min(other.len);
        (0..limit).find(|&i| self.bit(i) != other.bit(i)).unwrap_or(limit)
    }

    /// Whether `self` is `other` or a shorter prefix of it
    pub fn covers(&self, other: &Prefix) -> bool {
        self.len <= other.len && self.common_len(other) == self.len
    }

    /// The first `len` bits of `self`, `len` not exceeding `self.len`
    fn truncated(&self, len: usize) -> Prefix {
        let mut prefix = self.clone();
        prefix.len = len.min(self.len);
        for (i, byte) in prefix.address.iter_mut().enumerate() {
            let first_bit = i * 8;
            if first_bit >= prefix.len {
                *byte = 0;
            } else if prefix.len - first_bit < 8 {
                *byte &= 0xffu8 << (8 - (prefix.len - first_bit));
            }
        }
        prefix
    }
}

impl From<IpNet> for Prefix {
    fn from(net: IpNet) -> Self {
        let address = match net.network() {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        };
        Self {
            address,
            len: net.prefix_len() as usize,
        }
    }
}

impl FromStr for Prefix {
    type Err = FlowgridError;

    /// `10.1.0.0/16`, `2001:db8::/32`, or a bare address as a host prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(net.into());
        }
        let addr: IpAddr = s
            .parse()
            .map_err(|_| FlowgridError::invalid_input("prefix", format!("'{}' is not an address or prefix", s)))?;
        let host_len = if addr.is_ipv4() { 32 } else { 128 };
        let net = IpNet::new(addr, host_len).map_err(|e| FlowgridError::invalid_input("prefix", e.to_string()))?;
        Ok(net.into())
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address.len() {
            4 => {
                let a = &self.address;
                write!(f, "{}.{}.{}.{}/{}", a[0], a[1], a[2], a[3], self.len)
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.address);
                write!(f, "{}/{}", std::net::Ipv6Addr::from(octets), self.len)
            }
            _ => {
                for byte in &self.address {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "/{}", self.len)
            }
        }
    }
}

#[derive(Debug)]
struct Node<V> {
    prefix: Prefix,
    /// `None` for aggregates
    value: Option<V>,
    parent: Option<usize>,
    children: [Option<usize>; 2],
}

#[derive(Debug)]
struct Arena<V> {
    nodes: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    root: Option<usize>,
    values: usize,
}

impl<V> Arena<V> {
    fn node(&self, i: usize) -> &Node<V> {
        match &self.nodes[i] {
            Some(node) => node,
            None => unreachable!("dangling trie index {}", i),
        }
    }

    fn node_mut(&mut self, i: usize) -> &mut Node<V> {
        match &mut self.nodes[i] {
            Some(node) => node,
            None => unreachable!("dangling trie index {}", i),
        }
    }

    fn alloc(&mut self, prefix: Prefix, value: Option<V>) -> usize {
        let node = Node {
            prefix,
            value,
            parent: None,
            children: [None, None],
        };
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, i: usize) {
        self.nodes[i] = None;
        self.free.push(i);
    }

    /// Hang `child` under `parent`, or make it the root
    fn link(&mut self, parent: Option<usize>, child: usize) {
        match parent {
            Some(p) => {
                let side = self.node(child).prefix.bit(self.node(p).prefix.len) as usize;
                self.node_mut(p).children[side] = Some(child);
            }
            None => self.root = Some(child),
        }
        self.node_mut(child).parent = parent;
    }

    /// Walk from the root while nodes cover `prefix`; the callback sees each
    fn descend(&self, prefix: &Prefix, mut visit: impl FnMut(usize, &Node<V>)) -> (Option<usize>, Option<usize>) {
        let mut parent = None;
        let mut current = self.root;
        while let Some(i) = current {
            let node = self.node(i);
            if !node.prefix.covers(prefix) {
                break;
            }
            visit(i, node);
            if node.prefix.len == prefix.len {
                break;
            }
            parent = Some(i);
            current = node.children[prefix.bit(node.prefix.len) as usize];
        }
        (parent, current)
    }

    fn find(&self, prefix: &Prefix) -> Option<usize> {
        let mut found = None;
        self.descend(prefix, |i, node| {
            if node.prefix.len == prefix.len {
                found = Some(i);
            }
        });
        found
    }

    /// Remove node `i`, which has at most one child
    fn splice(&mut self, i: usize) -> Option<usize> {
        let node = self.node(i);
        let child = node.children[0].or(node.children[1]);
        let parent = node.parent;
        match parent {
            Some(p) => {
                let slot = self.node(p).children.iter().position(|c| *c == Some(i));
                if let Some(slot) = slot {
                    self.node_mut(p).children[slot] = child;
                }
            }
            None => self.root = child,
        }
        if let Some(c) = child {
            self.node_mut(c).parent = parent;
        }
        self.release(i);
        parent
    }
}

/// Thread-safe patricia trie keyed by [`Prefix`]
#[derive(Debug)]
pub struct PatriciaTrie<V> {
    max_prefix_len: usize,
    arena: RwLock<Arena<V>>,
}

impl<V: Clone + PartialEq> PatriciaTrie<V> {
    pub fn new(max_prefix_len: usize) -> Self {
        Self {
            max_prefix_len,
            arena: RwLock::new(Arena {
                nodes: Vec::new(),
                free: Vec::new(),
                root: None,
                values: 0,
            }),
        }
    }

    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }

    fn check(&self, prefix: &Prefix) -> FlowgridResult<()> {
        if prefix.len > self.max_prefix_len {
            return Err(FlowgridError::invalid_input(
                "prefix",
                format!(
                    "length {} is greater than the maximum {}",
                    prefix.len, self.max_prefix_len
                ),
            ));
        }
        Ok(())
    }

    /// Insert or replace; returns the previous value
    pub fn put(&self, prefix: Prefix, value: V) -> FlowgridResult<Option<V>> {
        self.check(&prefix)?;
        let mut arena = self.arena.write();

        let (parent, current) = arena.descend(&prefix, |_, _| {});
        let Some(existing) = current else {
            let leaf = arena.alloc(prefix, Some(value));
            arena.link(parent, leaf);
            arena.values += 1;
            return Ok(None);
        };

        if arena.node(existing).prefix.len == prefix.len && arena.node(existing).prefix.covers(&prefix) {
            let node = arena.node_mut(existing);
            node.prefix = prefix;
            let previous = node.value.replace(value);
            if previous.is_none() {
                arena.values += 1;
            }
            return Ok(previous);
        }

        let common = arena.node(existing).prefix.common_len(&prefix);
        if common == prefix.len {
            // The new prefix sits between `parent` and `existing`
            let node = arena.alloc(prefix, Some(value));
            arena.link(parent, node);
            arena.link(Some(node), existing);
        } else {
            let aggregate_prefix = prefix.truncated(common);
            let aggregate = arena.alloc(aggregate_prefix, None);
            arena.link(parent, aggregate);
            arena.link(Some(aggregate), existing);
            let leaf = arena.alloc(prefix, Some(value));
            arena.link(Some(aggregate), leaf);
        }
        arena.values += 1;
        Ok(None)
    }

    /// Exact match
    pub fn lookup(&self, prefix: &Prefix) -> FlowgridResult<Option<V>> {
        self.check(prefix)?;
        let arena = self.arena.read();
        Ok(arena.find(prefix).and_then(|i| arena.node(i).value.clone()))
    }

    /// Value of the longest stored prefix covering `prefix`
    pub fn match_prefix(&self, prefix: &Prefix) -> FlowgridResult<Option<V>> {
        self.check(prefix)?;
        let arena = self.arena.read();
        let mut best = None;
        arena.descend(prefix, |_, node| {
            if node.value.is_some() {
                best = node.value.clone();
            }
        });
        Ok(best)
    }

    /// Remove `prefix` if it currently maps to `value`
    pub fn remove(&self, prefix: &Prefix, value: &V) -> bool {
        if prefix.len > self.max_prefix_len {
            return false;
        }
        let mut arena = self.arena.write();
        let Some(i) = arena.find(prefix) else {
            return false;
        };
        if arena.node(i).value.as_ref() != Some(value) {
            return false;
        }

        arena.values -= 1;
        let node = arena.node_mut(i);
        if node.children.iter().all(Option::is_some) {
            node.value = None;
            return true;
        }

        // An aggregate left with a single child no longer marks a divergence
        let parent = arena.splice(i);
        if let Some(p) = parent {
            let node = arena.node(p);
            if node.value.is_none() && node.children.iter().filter(|c| c.is_some()).count() <= 1 {
                arena.splice(p);
            }
        }
        true
    }

    /// Stored entries in tree order, aggregates skipped
    pub fn entries(&self) -> Vec<(Prefix, V)> {
        let arena = self.arena.read();
        let mut out = Vec::with_capacity(arena.values);
        let mut stack: Vec<usize> = arena.root.into_iter().collect();
        while let Some(i) = stack.pop() {
            let node = arena.node(i);
            if let Some(value) = &node.value {
                out.push((node.prefix.clone(), value.clone()));
            }
            stack.extend(node.children[1]);
            stack.extend(node.children[0]);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.arena.read().values
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
