//! Per-packet metadata attributes.
//!
//! Modules declare named attributes with an access mode; this pipeline
//! assigns each producer/consumer chain one byte offset inside the packet's
//! 128-byte metadata region, so a writer and every reader downstream of it
//! (up to the next overwriting module) address the same bytes. Offsets are
//! recomputed from scratch on every structural change, before workers
//! resume.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::packet::PKT_METADATA;

/// Max size of a single attribute, in bytes.
pub const ATTR_MAX_SIZE: usize = 32;

/// Max number of attributes one module may declare.
pub const MAX_ATTRS_PER_MODULE: usize = 16;

/// Writer whose value no reachable module reads; the write can be skipped.
pub const OFFSET_NO_READ: i8 = -1;

/// Reader with no reachable writer; any read would see garbage.
pub const OFFSET_NO_WRITE: i8 = -2;

/// The metadata region cannot fit this attribute's scope component.
pub const OFFSET_NO_SPACE: i8 = -3;

#[inline]
pub fn is_valid_offset(offset: i8) -> bool {
    offset >= 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    Update,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Attribute {
    pub name: String,
    pub size: usize,
    pub mode: AccessMode,
}

/// Process-wide attribute name registry: every module using a name must
/// agree on its size. Entries are refcounted by declaring modules.
#[derive(Default)]
pub struct AttrRegistry {
    attrs: HashMap<String, (usize, usize)>, // name -> (size, refcount)
}

impl AttrRegistry {
    pub fn register(&mut self, name: &str, size: usize) -> Result<(), String> {
        if name.is_empty() {
            return Err("empty attribute name".to_string());
        }
        if size == 0 || size > ATTR_MAX_SIZE {
            return Err(format!("attribute {name} size {size} out of range"));
        }
        match self.attrs.get_mut(name) {
            Some((existing, refcnt)) => {
                if *existing != size {
                    return Err(format!(
                        "attribute {name} size mismatch: {size} vs registered {existing}"
                    ));
                }
                *refcnt += 1;
                Ok(())
            }
            None => {
                self.attrs.insert(name.to_string(), (size, 1));
                Ok(())
            }
        }
    }

    pub fn deregister(&mut self, name: &str) {
        if let Some((_, refcnt)) = self.attrs.get_mut(name) {
            *refcnt -= 1;
            if *refcnt == 0 {
                self.attrs.remove(name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// One module's view for the offset computation: a stable key, its declared
/// attributes, and the modules its output gates feed.
pub struct ModuleAttrsView<'a> {
    pub key: &'a str,
    pub attrs: &'a [Attribute],
    pub successors: &'a [usize],
}

struct Component {
    attr: String,
    size: usize,
    // (module index, attr index) pairs sharing this offset.
    members: BTreeSet<(usize, usize)>,
    live: bool,
}

/// Compute the offset table for every module. `out[m][a]` is the offset of
/// module `m`'s attribute `a`, or a sentinel.
pub fn compute_offsets(modules: &[ModuleAttrsView<'_>]) -> Vec<Vec<i8>> {
    // Default sentinels; producers overwritten below if their scope gets an
    // offset.
    let mut offsets: Vec<Vec<i8>> = modules
        .iter()
        .map(|m| {
            m.attrs
                .iter()
                .map(|a| match a.mode {
                    AccessMode::Read => OFFSET_NO_WRITE,
                    AccessMode::Write | AccessMode::Update => OFFSET_NO_READ,
                })
                .collect()
        })
        .collect();

    let mut components: Vec<Component> = Vec::new();
    // (module index, attr name) -> component index, for merge detection.
    let mut claimed: HashMap<(usize, String), usize> = HashMap::new();

    // Stable order: modules by key, attributes in declaration order.
    let mut order: Vec<usize> = (0..modules.len()).collect();
    order.sort_by_key(|&i| modules[i].key);

    for &mi in &order {
        for (ai, attr) in modules[mi].attrs.iter().enumerate() {
            if attr.mode == AccessMode::Read {
                continue;
            }
            if claimed.contains_key(&(mi, attr.name.clone())) {
                // Already swept into an upstream writer's component; its
                // downstream was traversed then.
                continue;
            }
            let mut comp = components.len();
            components.push(Component {
                attr: attr.name.clone(),
                size: attr.size,
                members: BTreeSet::from([(mi, ai)]),
                live: true,
            });
            claimed.insert((mi, attr.name.clone()), comp);

            // Walk downstream; the scope ends wherever another module
            // overwrites the same name.
            let mut visited: BTreeSet<usize> = BTreeSet::from([mi]);
            let mut queue: VecDeque<usize> = modules[mi].successors.iter().copied().collect();
            while let Some(ni) = queue.pop_front() {
                if !visited.insert(ni) {
                    continue;
                }
                let found = modules[ni]
                    .attrs
                    .iter()
                    .enumerate()
                    .find(|(_, a)| a.name == attr.name);
                match found {
                    Some((nai, na)) if na.mode == AccessMode::Write => {
                        // Overwritten: a fresh scope starts at ni.
                        let _ = nai;
                        continue;
                    }
                    Some((nai, _)) => {
                        // Reader or updater joins the scope.
                        match claimed.get(&(ni, attr.name.clone())).copied() {
                            Some(other) if other != comp => {
                                // Two producers share this consumer; their
                                // scopes collapse into one offset.
                                let merged: Vec<_> =
                                    components[comp].members.iter().copied().collect();
                                for m in merged {
                                    components[other].members.insert(m);
                                    claimed.insert((m.0, attr.name.clone()), other);
                                }
                                components[comp].live = false;
                                comp = other;
                            }
                            _ => {
                                components[comp].members.insert((ni, nai));
                                claimed.insert((ni, attr.name.clone()), comp);
                            }
                        }
                        queue.extend(modules[ni].successors.iter().copied());
                    }
                    None => {
                        queue.extend(modules[ni].successors.iter().copied());
                    }
                }
            }
        }
    }

    // Single-member components are lone producers: nobody reads them, keep
    // the sentinel and spend no space.
    let mut alloc: Vec<usize> = components
        .iter()
        .enumerate()
        .filter(|(_, c)| c.live && c.members.len() > 1)
        .map(|(i, _)| i)
        .collect();

    // Biggest first, ties broken by a stable key so the layout is a pure
    // function of the graph.
    alloc.sort_by(|&a, &b| {
        let ca = &components[a];
        let cb = &components[b];
        cb.size
            .cmp(&ca.size)
            .then_with(|| {
                let ka = ca.members.iter().next().map(|&(m, _)| modules[m].key);
                let kb = cb.members.iter().next().map(|&(m, _)| modules[m].key);
                ka.cmp(&kb)
            })
            .then_with(|| ca.attr.cmp(&cb.attr))
    });

    let mut used = [false; PKT_METADATA];
    for &ci in &alloc {
        let size = components[ci].size;
        let slot = first_fit(&used, size);
        let value = match slot {
            Some(off) => {
                used[off..off + size].iter_mut().for_each(|b| *b = true);
                off as i8
            }
            None => OFFSET_NO_SPACE,
        };
        for &(mi, ai) in &components[ci].members {
            offsets[mi][ai] = value;
        }
    }

    offsets
}

fn first_fit(used: &[bool; PKT_METADATA], size: usize) -> Option<usize> {
    if size == 0 || size > PKT_METADATA {
        return None;
    }
    let mut off = 0;
    while off + size <= PKT_METADATA {
        match used[off..off + size].iter().position(|&b| b) {
            None => return Some(off),
            Some(p) => off += p + 1,
        }
    }
    None
}

/// Summary of the registry for the control plane.
pub fn registry_summary(reg: &AttrRegistry) -> BTreeMap<String, (usize, usize)> {
    reg.attrs
        .iter()
        .map(|(k, v)| (k.clone(), *v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str, size: usize, mode: AccessMode) -> Attribute {
        Attribute {
            name: name.to_string(),
            size,
            mode,
        }
    }

    fn views<'a>(
        mods: &'a [(&'a str, Vec<Attribute>, Vec<usize>)],
    ) -> Vec<ModuleAttrsView<'a>> {
        mods.iter()
            .map(|(key, attrs, succ)| ModuleAttrsView {
                key,
                attrs,
                successors: succ,
            })
            .collect()
    }

    #[test]
    fn writer_reader_share_offset() {
        let mods = [
            ("a", vec![attr("ttl", 1, AccessMode::Write)], vec![1]),
            ("b", vec![attr("ttl", 1, AccessMode::Read)], vec![]),
        ];
        let offs = compute_offsets(&views(&mods));
        assert!(is_valid_offset(offs[0][0]));
        assert_eq!(offs[0][0], offs[1][0]);
    }

    #[test]
    fn disconnected_pair_gets_sentinels() {
        let mods = [
            ("a", vec![attr("ttl", 1, AccessMode::Write)], vec![]),
            ("b", vec![attr("ttl", 1, AccessMode::Read)], vec![]),
        ];
        let offs = compute_offsets(&views(&mods));
        assert_eq!(offs[0][0], OFFSET_NO_READ);
        assert_eq!(offs[1][0], OFFSET_NO_WRITE);
    }

    #[test]
    fn overwrite_splits_scopes() {
        // a writes, x overwrites, b reads: b shares with x, not a.
        let mods = [
            ("a", vec![attr("mark", 4, AccessMode::Write)], vec![1]),
            ("x", vec![attr("mark", 4, AccessMode::Write)], vec![2]),
            ("b", vec![attr("mark", 4, AccessMode::Read)], vec![]),
        ];
        let offs = compute_offsets(&views(&mods));
        assert_eq!(offs[0][0], OFFSET_NO_READ);
        assert!(is_valid_offset(offs[1][0]));
        assert_eq!(offs[1][0], offs[2][0]);
    }

    #[test]
    fn update_extends_scope() {
        let mods = [
            ("a", vec![attr("mark", 4, AccessMode::Write)], vec![1]),
            ("u", vec![attr("mark", 4, AccessMode::Update)], vec![2]),
            ("b", vec![attr("mark", 4, AccessMode::Read)], vec![]),
        ];
        let offs = compute_offsets(&views(&mods));
        assert!(is_valid_offset(offs[0][0]));
        assert_eq!(offs[0][0], offs[1][0]);
        assert_eq!(offs[1][0], offs[2][0]);
    }

    #[test]
    fn two_writers_one_reader_merge() {
        let mods = [
            ("w1", vec![attr("tag", 2, AccessMode::Write)], vec![2]),
            ("w2", vec![attr("tag", 2, AccessMode::Write)], vec![2]),
            ("r", vec![attr("tag", 2, AccessMode::Read)], vec![]),
        ];
        let offs = compute_offsets(&views(&mods));
        assert!(is_valid_offset(offs[0][0]));
        assert_eq!(offs[0][0], offs[1][0]);
        assert_eq!(offs[1][0], offs[2][0]);
    }

    #[test]
    fn pass_through_module_carries_scope() {
        let mods = [
            ("a", vec![attr("ttl", 1, AccessMode::Write)], vec![1]),
            ("mid", vec![], vec![2]),
            ("b", vec![attr("ttl", 1, AccessMode::Read)], vec![]),
        ];
        let offs = compute_offsets(&views(&mods));
        assert!(is_valid_offset(offs[0][0]));
        assert_eq!(offs[0][0], offs[1][0]);
    }

    #[test]
    fn out_of_space_yields_sentinel() {
        // Five independent 32-byte scopes need 160 bytes; only 128 exist.
        let mods: Vec<(String, Vec<Attribute>, Vec<usize>)> = (0..5)
            .flat_map(|i| {
                let name = format!("big{i}");
                vec![
                    (
                        format!("w{i}"),
                        vec![attr(&name, 32, AccessMode::Write)],
                        vec![],
                    ),
                    (
                        format!("r{i}"),
                        vec![attr(&name, 32, AccessMode::Read)],
                        vec![],
                    ),
                ]
            })
            .collect();
        // Wire each writer to its reader: writer at 2i feeds reader 2i+1.
        let wired: Vec<(&str, Vec<Attribute>, Vec<usize>)> = mods
            .iter()
            .enumerate()
            .map(|(i, (k, a, _))| {
                let succ = if i % 2 == 0 { vec![i + 1] } else { vec![] };
                (k.as_str(), a.clone(), succ)
            })
            .collect();
        let offs = compute_offsets(&views(&wired));
        let no_space = offs.iter().filter(|o| o[0] == OFFSET_NO_SPACE).count();
        assert_eq!(no_space, 2, "one full scope (writer+reader) must overflow");
        let valid = offs.iter().filter(|o| is_valid_offset(o[0])).count();
        assert_eq!(valid, 8);
    }

    #[test]
    fn deterministic_layout() {
        let mods = [
            ("a", vec![attr("x", 4, AccessMode::Write)], vec![2]),
            ("b", vec![attr("y", 8, AccessMode::Write)], vec![3]),
            ("c", vec![attr("x", 4, AccessMode::Read)], vec![]),
            ("d", vec![attr("y", 8, AccessMode::Read)], vec![]),
        ];
        let a = compute_offsets(&views(&mods));
        let b = compute_offsets(&views(&mods));
        assert_eq!(a, b);
        // Bigger scope first.
        assert_eq!(b[1][0], 0);
        assert_eq!(b[0][0], 8);
    }

    #[test]
    fn registry_size_conflicts_rejected() {
        let mut reg = AttrRegistry::default();
        reg.register("ttl", 1).unwrap();
        reg.register("ttl", 1).unwrap();
        assert!(reg.register("ttl", 2).is_err());
        reg.deregister("ttl");
        reg.deregister("ttl");
        assert!(reg.is_empty());
        // Freed name can change size.
        reg.register("ttl", 2).unwrap();
    }
}
