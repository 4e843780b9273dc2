// Tag-manager linkage for the FPC store.
//
// Tag-ref nodes live in a slab arena owned by the index; pages and tags
// refer to nodes by index, and each node carries the page handle, its
// tag, and prev/next links in the tag's membership list. A page with no
// user tags is threaded into the distinguished "untagged" sentinel so
// every live page is reachable from exactly the tags it carries.
//
// The whole index is serialized under one mutex (the tag-manager
// service's domain); page record locks nest inside it, never the other
// way around.

use crate::concurrent::registry::audit;
use crate::store::objects::{PageRecord, HOF_BEING_DELETED, HOF_LINKED_BY_TM};
use crate::store::{timestamp, TAG_OBJECTS_CREATED};
use parking_lot::Mutex;
use slab::Slab;
use std::collections::HashMap;
use std::sync::Arc;

/// Tag-ref slots built into every page record; pages carrying more tags
/// allocate the overflow vector lazily
pub const NUM_INLINE_TAG_REFS: usize = 1;

/// Upper bound on tags per page
pub const MAX_TAGS_PER_PAGE: usize = u16::MAX as usize;

const NO_REF: u32 = u32::MAX;

/// Per-page array of tag-ref indices: a fixed inline part plus a lazily
/// allocated overflow.
pub struct TagRefArray {
    inline: [u32; NUM_INLINE_TAG_REFS],
    overflow: Vec<u32>,
    count: u16,
}

impl TagRefArray {
    pub fn new() -> Self {
        Self {
            inline: [NO_REF; NUM_INLINE_TAG_REFS],
            overflow: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push(&mut self, ref_index: u32) {
        let slot = self.count as usize;
        debug_assert!(slot < MAX_TAGS_PER_PAGE);
        if slot < NUM_INLINE_TAG_REFS {
            self.inline[slot] = ref_index;
        } else {
            self.overflow.push(ref_index);
        }
        self.count += 1;
    }

    fn take_all(&mut self) -> Vec<u32> {
        let mut refs = Vec::with_capacity(self.len());
        refs.extend_from_slice(&self.inline[..self.len().min(NUM_INLINE_TAG_REFS)]);
        refs.append(&mut self.overflow);
        self.inline = [NO_REF; NUM_INLINE_TAG_REFS];
        self.count = 0;
        refs
    }

    /// Iterates the inline slots first, then the overflow.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.inline[..self.len().min(NUM_INLINE_TAG_REFS)]
            .iter()
            .copied()
            .chain(self.overflow.iter().copied())
    }
}

impl Default for TagRefArray {
    fn default() -> Self {
        Self::new()
    }
}

struct TagEntry {
    name: Box<[u8]>,
    first: Option<u32>,
    count: u32,
    untagged: bool,
}

struct TagRefNode {
    page: Arc<PageRecord>,
    tag: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

struct TagIndexInner {
    tags: Slab<TagEntry>,
    refs: Slab<TagRefNode>,
    by_name: HashMap<Box<[u8]>, u32>,
    untagged: u32,
}

impl TagIndexInner {
    /// Inserts a node at the head of the tag's list.
    fn link(&mut self, page: &Arc<PageRecord>, tag_key: u32) -> u32 {
        let first = self.tags[tag_key as usize].first;
        let ref_index = self.refs.insert(TagRefNode {
            page: Arc::clone(page),
            tag: tag_key,
            prev: None,
            next: first,
        }) as u32;
        if let Some(next) = first {
            self.refs[next as usize].prev = Some(ref_index);
        }
        let tag = &mut self.tags[tag_key as usize];
        tag.first = Some(ref_index);
        tag.count += 1;
        ref_index
    }

    /// Splices a node out of its tag's list; returns the tag key iff the
    /// tag became empty and is not the untagged sentinel, so the caller
    /// can dispose it.
    fn unlink(&mut self, ref_index: u32) -> Option<u32> {
        let node = self.refs.remove(ref_index as usize);
        match node.prev {
            Some(prev) => self.refs[prev as usize].next = node.next,
            None => self.tags[node.tag as usize].first = node.next,
        }
        if let Some(next) = node.next {
            self.refs[next as usize].prev = node.prev;
        }
        let tag = &mut self.tags[node.tag as usize];
        debug_assert!(tag.count > 0);
        tag.count -= 1;
        if tag.count == 0 && !tag.untagged {
            Some(node.tag)
        } else {
            None
        }
    }

    fn dispose_tag(&mut self, tag_key: u32) {
        let tag = self.tags.remove(tag_key as usize);
        debug_assert!(tag.count == 0 && tag.first.is_none());
        self.by_name.remove(&tag.name);
    }

    fn get_or_create_tag(&mut self, name: &[u8]) -> u32 {
        if let Some(&key) = self.by_name.get(name) {
            return key;
        }
        let key = self.tags.insert(TagEntry {
            name: name.into(),
            first: None,
            count: 0,
            untagged: false,
        }) as u32;
        self.by_name.insert(name.into(), key);
        TAG_OBJECTS_CREATED.increment();
        key
    }

    fn resolve(&self, names: &[Vec<u8>]) -> Vec<Option<u32>> {
        names
            .iter()
            .map(|name| self.by_name.get(name.as_slice()).copied())
            .collect()
    }

    /// Pages threaded under `tag_key`, skipping records in deletion.
    fn pages_of(&self, tag_key: u32) -> Vec<Arc<PageRecord>> {
        let mut pages = Vec::new();
        let mut cursor = self.tags[tag_key as usize].first;
        while let Some(index) = cursor {
            let node = &self.refs[index as usize];
            if node.page.flags.are_clear(HOF_BEING_DELETED) {
                pages.push(Arc::clone(&node.page));
            }
            cursor = node.next;
        }
        pages
    }

    /// Does the page carry at least `min_matches` tags from `query`?
    /// Iterates the page's own ref array (inline then overflow) and
    /// scans the query set per ref, with an early exit; the right order
    /// for small query sets and bounded per-page tag counts.
    fn page_matches(&self, refs: &TagRefArray, min_matches: u32, query: &[u32]) -> bool {
        if min_matches == 0 || query.is_empty() {
            return false;
        }
        let mut matches = 0;
        for ref_index in refs.iter() {
            let tag = self.refs[ref_index as usize].tag;
            for &candidate in query {
                if candidate == tag {
                    matches += 1;
                    if matches == min_matches {
                        return true;
                    }
                    break;
                }
            }
        }
        false
    }
}

/// Mode of a tag-based page selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    All,
    Any,
    NotAny,
}

pub struct TagIndex {
    inner: Mutex<TagIndexInner>,
}

impl TagIndex {
    pub fn new() -> Self {
        let mut tags = Slab::new();
        let untagged = tags.insert(TagEntry {
            name: Box::from(&b"<untagged>"[..]),
            first: None,
            count: 0,
            untagged: true,
        }) as u32;
        Self {
            inner: Mutex::new(TagIndexInner {
                tags,
                refs: Slab::new(),
                by_name: HashMap::new(),
                untagged,
            }),
        }
    }

    /// Re-tags a page: unlinks whatever it was linked under and links it
    /// under `tag_names` (or the untagged sentinel when none are given).
    pub fn retag(&self, page: &Arc<PageRecord>, tag_names: &[Vec<u8>]) {
        audit::enter_shared_lock();
        let mut inner = self.inner.lock();
        let mut body = page.lock_body();
        for ref_index in body.tag_refs.take_all() {
            if let Some(empty_tag) = inner.unlink(ref_index) {
                inner.dispose_tag(empty_tag);
            }
        }
        if tag_names.is_empty() {
            let untagged = inner.untagged;
            let ref_index = inner.link(page, untagged);
            body.tag_refs.push(ref_index);
        } else {
            for name in tag_names.iter().take(MAX_TAGS_PER_PAGE) {
                let tag_key = inner.get_or_create_tag(name);
                let ref_index = inner.link(page, tag_key);
                body.tag_refs.push(ref_index);
            }
        }
        page.flags.set(HOF_LINKED_BY_TM);
        drop(body);
        drop(inner);
        audit::exit_shared_lock();
    }

    /// Unlinks a page entirely; used on removal and clean-up.
    pub fn unlink_page(&self, page: &Arc<PageRecord>) {
        audit::enter_shared_lock();
        let mut inner = self.inner.lock();
        let mut body = page.lock_body();
        for ref_index in body.tag_refs.take_all() {
            if let Some(empty_tag) = inner.unlink(ref_index) {
                inner.dispose_tag(empty_tag);
            }
        }
        page.flags.clear(HOF_LINKED_BY_TM);
        drop(body);
        drop(inner);
        audit::exit_shared_lock();
    }

    /// All user tag names (the untagged sentinel is invisible).
    pub fn tag_names(&self) -> Vec<Vec<u8>> {
        audit::enter_shared_lock();
        let inner = self.inner.lock();
        let names = inner
            .tags
            .iter()
            .filter(|(_, tag)| !tag.untagged)
            .map(|(_, tag)| tag.name.to_vec())
            .collect();
        drop(inner);
        audit::exit_shared_lock();
        names
    }

    pub fn num_tags(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    /// Selects live pages by tag predicate. Unknown query tags simply
    /// never match (`All` with an unknown tag selects nothing).
    pub fn select_pages(&self, mode: TagMatch, tag_names: &[Vec<u8>]) -> Vec<Arc<PageRecord>> {
        audit::enter_shared_lock();
        let inner = self.inner.lock();
        let resolved = inner.resolve(tag_names);
        let pages = match mode {
            TagMatch::All => {
                if resolved.iter().any(Option::is_none) || resolved.is_empty() {
                    Vec::new()
                } else {
                    let query: Vec<u32> = resolved.into_iter().flatten().collect();
                    let min = query.len() as u32;
                    inner
                        .pages_of(query[0])
                        .into_iter()
                        .filter(|page| {
                            let body = page.lock_body();
                            inner.page_matches(&body.tag_refs, min, &query)
                        })
                        .collect()
                }
            }
            TagMatch::Any => {
                let query: Vec<u32> = resolved.into_iter().flatten().collect();
                let mut seen = std::collections::HashSet::new();
                let mut pages = Vec::new();
                for &tag_key in &query {
                    for page in inner.pages_of(tag_key) {
                        if seen.insert(Arc::as_ptr(&page) as usize) {
                            pages.push(page);
                        }
                    }
                }
                pages
            }
            // an empty query set matches nothing, so "not matching any
            // of nothing" deliberately selects no rows instead of the
            // whole store
            TagMatch::NotAny if tag_names.is_empty() => Vec::new(),
            TagMatch::NotAny => {
                let query: Vec<u32> = resolved.into_iter().flatten().collect();
                let mut seen = std::collections::HashSet::new();
                let mut pages = Vec::new();
                // every live page has at least one ref node, so the ref
                // slab enumerates the whole page population
                for (_, node) in inner.refs.iter() {
                    if node.page.flags.are_set(HOF_BEING_DELETED) {
                        continue;
                    }
                    if !seen.insert(Arc::as_ptr(&node.page) as usize) {
                        continue;
                    }
                    let matches = {
                        let body = node.page.lock_body();
                        inner.page_matches(&body.tag_refs, 1, &query)
                    };
                    if !matches {
                        pages.push(Arc::clone(&node.page));
                    }
                }
                pages
            }
        };
        drop(inner);
        audit::exit_shared_lock();
        pages
    }

    /// Names of the user tags a page carries (empty for untagged pages).
    pub fn page_tag_names(&self, page: &Arc<PageRecord>) -> Vec<Vec<u8>> {
        audit::enter_shared_lock();
        let inner = self.inner.lock();
        let body = page.lock_body();
        let names = body
            .tag_refs
            .iter()
            .map(|ref_index| inner.refs[ref_index as usize].tag)
            .filter(|&tag| tag != inner.untagged)
            .map(|tag| inner.tags[tag as usize].name.to_vec())
            .collect();
        drop(body);
        drop(inner);
        audit::exit_shared_lock();
        names
    }

    /// Live pages older than their expiration time.
    pub fn expired_pages(&self) -> Vec<Arc<PageRecord>> {
        audit::enter_shared_lock();
        let inner = self.inner.lock();
        let now = timestamp();
        let mut seen = std::collections::HashSet::new();
        let mut pages = Vec::new();
        for (_, node) in inner.refs.iter() {
            if node.page.flags.are_set(HOF_BEING_DELETED) {
                continue;
            }
            if !seen.insert(Arc::as_ptr(&node.page) as usize) {
                continue;
            }
            let expired = node.page.lock_body().exp_time <= now;
            if expired {
                pages.push(Arc::clone(&node.page));
            }
        }
        drop(inner);
        audit::exit_shared_lock();
        pages
    }

    /// Sum of live tag reference counts; test/diagnostic hook.
    pub fn total_refs(&self) -> usize {
        self.inner.lock().refs.len()
    }

    /// Number of nodes reachable by walking tag lists; must equal the
    /// per-tag counts (test/diagnostic hook).
    pub fn check_list_consistency(&self) -> bool {
        let inner = self.inner.lock();
        let mut reachable = 0usize;
        for (key, tag) in inner.tags.iter() {
            let mut walked = 0u32;
            let mut cursor = tag.first;
            while let Some(index) = cursor {
                let node = &inner.refs[index as usize];
                if node.tag != key as u32 {
                    return false;
                }
                walked += 1;
                cursor = node.next;
            }
            if walked != tag.count {
                return false;
            }
            reachable += walked as usize;
        }
        reachable == inner.refs.len()
    }
}

impl Default for TagIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::registry::register_worker_thread;

    fn page(hash: u64, name: &[u8]) -> Arc<PageRecord> {
        Arc::new(PageRecord::new(hash, name))
    }

    fn names(list: &[&str]) -> Vec<Vec<u8>> {
        list.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_link_unlink_bookkeeping() {
        let _registration = register_worker_thread().unwrap();
        let index = TagIndex::new();
        let p1 = page(1, b"p1");
        let p2 = page(2, b"p2");
        index.retag(&p1, &names(&["t1", "t2"]));
        index.retag(&p2, &names(&["t2"]));
        assert_eq!(index.num_tags(), 2);
        assert_eq!(index.total_refs(), 3);
        assert!(index.check_list_consistency());

        // dropping p1's tags disposes t1 (now empty) but keeps t2
        index.unlink_page(&p1);
        assert_eq!(index.num_tags(), 1);
        assert_eq!(index.total_refs(), 1);
        assert!(index.check_list_consistency());

        index.unlink_page(&p2);
        assert_eq!(index.num_tags(), 0);
        assert_eq!(index.total_refs(), 0);
    }

    #[test]
    fn test_untagged_sentinel_survives() {
        let _registration = register_worker_thread().unwrap();
        let index = TagIndex::new();
        let p = page(1, b"plain");
        index.retag(&p, &[]);
        assert_eq!(index.num_tags(), 0); // sentinel is not a user tag
        assert_eq!(index.total_refs(), 1);
        index.unlink_page(&p);
        assert_eq!(index.total_refs(), 0);
        assert!(index.check_list_consistency());
    }

    #[test]
    fn test_select_all_any_not() {
        let _registration = register_worker_thread().unwrap();
        let index = TagIndex::new();
        let p1 = page(1, b"p1");
        let p2 = page(2, b"p2");
        let p3 = page(3, b"p3");
        index.retag(&p1, &names(&["a", "b"]));
        index.retag(&p2, &names(&["b"]));
        index.retag(&p3, &[]);

        let all = index.select_pages(TagMatch::All, &names(&["a", "b"]));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name(), b"p1");

        let any = index.select_pages(TagMatch::Any, &names(&["b"]));
        assert_eq!(any.len(), 2);

        let not_any = index.select_pages(TagMatch::NotAny, &names(&["a"]));
        assert_eq!(not_any.len(), 2); // p2 and the untagged p3

        // unknown tag in an All query selects nothing
        assert!(index
            .select_pages(TagMatch::All, &names(&["a", "missing"]))
            .is_empty());
    }

    #[test]
    fn test_retag_replaces_tags() {
        let _registration = register_worker_thread().unwrap();
        let index = TagIndex::new();
        let p = page(1, b"p");
        index.retag(&p, &names(&["a", "b", "c"]));
        assert_eq!(index.num_tags(), 3);
        index.retag(&p, &names(&["c", "d"]));
        assert_eq!(index.num_tags(), 2);
        assert_eq!(index.total_refs(), 2);
        assert!(index.check_list_consistency());
        let selected = index.select_pages(TagMatch::Any, &names(&["a", "b"]));
        assert!(selected.is_empty());
    }
}
