use hickory_proto::rr::Name;

use crate::proto_utils::cmp_labels;

/// 域名后缀匹配树 / Label tree for suffix membership: registering `example.com`
/// matches it and every name below it, the longest registered suffix winning.
/// Labels compare case-insensitively.
#[derive(Debug, Clone)]
pub struct SuffixMatchTree<T> {
    label: Vec<u8>,
    /// Present iff this node is a registered suffix.
    value: Option<T>,
    /// Sorted by `cmp_labels`, at most one child per label.
    children: Vec<SuffixMatchTree<T>>,
}

impl<T> Default for SuffixMatchTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SuffixMatchTree<T> {
    pub fn new() -> Self {
        Self::node(Vec::new())
    }

    fn node(label: Vec<u8>) -> Self {
        Self {
            label,
            value: None,
            children: Vec::new(),
        }
    }

    pub fn label(&self) -> &[u8] {
        &self.label
    }

    pub fn is_terminal(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    /// Number of registered suffixes.
    pub fn len(&self) -> usize {
        usize::from(self.is_terminal()) + self.children.iter().map(Self::len).sum::<usize>()
    }

    pub fn add(&mut self, name: &Name, value: T) {
        let labels: Vec<&[u8]> = name.iter().collect();
        self.add_labels(&labels, value);
    }

    /// Register the suffix given by `labels` (leftmost label first).
    ///
    /// An empty slice registers the root, which matches every name. Existing
    /// descendants of the target node are kept.
    pub fn add_labels<L: AsRef<[u8]>>(&mut self, labels: &[L], value: T) {
        match labels.split_last() {
            None => self.value = Some(value),
            Some((last, rest)) => self.child_or_insert(last.as_ref()).add_labels(rest, value),
        }
    }

    fn child_or_insert(&mut self, label: &[u8]) -> &mut SuffixMatchTree<T> {
        let idx = match self
            .children
            .binary_search_by(|child| cmp_labels(&child.label, label))
        {
            Ok(idx) => idx,
            Err(idx) => {
                self.children.insert(idx, Self::node(label.to_vec()));
                idx
            }
        };
        &mut self.children[idx]
    }

    fn child(&self, label: &[u8]) -> Option<&SuffixMatchTree<T>> {
        self.children
            .binary_search_by(|child| cmp_labels(&child.label, label))
            .ok()
            .map(|idx| &self.children[idx])
    }

    pub fn lookup(&self, name: &Name) -> Option<&T> {
        if self.children.is_empty() {
            return self.value.as_ref();
        }
        let labels: Vec<&[u8]> = name.iter().collect();
        self.lookup_labels(&labels)
    }

    pub fn lookup_labels<L: AsRef<[u8]>>(&self, labels: &[L]) -> Option<&T> {
        self.lookup_with_len(labels).map(|(value, _)| value)
    }

    /// Value of the deepest registered suffix of `labels`, together with the
    /// number of name bytes it covers (each label plus one separator).
    pub fn lookup_with_len<L: AsRef<[u8]>>(&self, labels: &[L]) -> Option<(&T, usize)> {
        let mut node = self;
        let mut consumed = 0usize;
        let mut best = self.value.as_ref().map(|value| (value, 0));
        let mut remaining = labels;

        while let Some((last, rest)) = remaining.split_last() {
            let Some(child) = node.child(last.as_ref()) else {
                break;
            };
            consumed += last.as_ref().len() + 1;
            if let Some(value) = child.value.as_ref() {
                best = Some((value, consumed));
            }
            node = child;
            remaining = rest;
        }

        best
    }

    /// Depth-first walk over registered suffixes, children before their parent.
    ///
    /// The callback receives the full label path of the suffix, leftmost label first.
    pub fn visit<F>(&self, mut f: F)
    where
        F: FnMut(&[&[u8]], &T),
    {
        let mut path = Vec::new();
        self.visit_inner(&mut path, &mut f);
    }

    fn visit_inner<'a, F>(&'a self, path: &mut Vec<&'a [u8]>, f: &mut F)
    where
        F: FnMut(&[&[u8]], &T),
    {
        for child in &self.children {
            path.push(&child.label);
            child.visit_inner(path, f);
            path.pop();
        }
        if let Some(value) = self.value.as_ref() {
            let labels: Vec<&[u8]> = path.iter().rev().copied().collect();
            f(&labels, value);
        }
    }
}
