//! HPACK indexing tables (RFC 7541 Section 2.3).

use std::collections::VecDeque;

use super::Field;

/// The 61-entry static table, RFC 7541 Appendix A. 1-indexed on the wire.
pub(super) const STATIC: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// Match against static + dynamic tables.
pub(super) enum Lookup {
    /// Wire index with both name and value matching.
    Full(usize),
    /// Wire index whose name matches; value must be sent literally.
    Name(usize),
    /// No table entry matches the name.
    Miss,
}

/// Per-entry overhead for size accounting (RFC 7541 Section 4.1).
const ENTRY_OVERHEAD: usize = 32;

fn entry_size(f: &Field) -> usize {
    f.name.len() + f.value.len() + ENTRY_OVERHEAD
}

/// The dynamic table: newest entry first, evicted from the back.
pub(super) struct DynamicTable {
    entries: VecDeque<Field>,
    used: usize,
    capacity: usize,
}

impl DynamicTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            used: 0,
            capacity,
        }
    }

    /// Entry by wire index (wire index 62 is dynamic slot 0).
    pub fn get(&self, wire_index: usize) -> Option<&Field> {
        self.entries.get(wire_index.checked_sub(STATIC.len() + 1)?)
    }

    pub fn insert(&mut self, field: Field) {
        let size = entry_size(&field);
        while self.used + size > self.capacity {
            match self.entries.pop_back() {
                Some(evicted) => self.used -= entry_size(&evicted),
                // An entry larger than the whole table empties it and is
                // itself not inserted (RFC 7541 Section 4.4).
                None => return,
            }
        }
        self.used += size;
        self.entries.push_front(field);
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.used > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                self.used -= entry_size(&evicted);
            }
        }
    }

    fn position(&self, pred: impl Fn(&Field) -> bool) -> Option<usize> {
        self.entries
            .iter()
            .position(pred)
            .map(|i| i + STATIC.len() + 1)
    }
}

/// Find the best wire index for `field` across both tables.
pub(super) fn lookup(dynamic: &DynamicTable, field: &Field) -> Lookup {
    let mut name_only = None;
    for (i, (name, value)) in STATIC.iter().enumerate() {
        if *name == &field.name[..] {
            if *value == &field.value[..] {
                return Lookup::Full(i + 1);
            }
            name_only.get_or_insert(i + 1);
        }
    }
    if let Some(idx) = dynamic.position(|f| f.name == field.name && f.value == field.value) {
        return Lookup::Full(idx);
    }
    if let Some(idx) = name_only {
        return Lookup::Name(idx);
    }
    if let Some(idx) = dynamic.position(|f| f.name == field.name) {
        return Lookup::Name(idx);
    }
    Lookup::Miss
}

/// Resolve a wire index to a full field.
pub(super) fn field_at(dynamic: &DynamicTable, wire_index: usize) -> Option<Field> {
    if wire_index == 0 {
        return None;
    }
    if wire_index <= STATIC.len() {
        let (name, value) = STATIC[wire_index - 1];
        return Some(Field::new(name, value));
    }
    dynamic.get(wire_index).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_has_61_entries() {
        assert_eq!(STATIC.len(), 61);
        assert_eq!(STATIC[1], (b":method" as &[u8], b"GET" as &[u8]));
        assert_eq!(STATIC[60].0, b"www-authenticate");
    }

    #[test]
    fn insert_and_index() {
        let mut table = DynamicTable::new(4096);
        table.insert(Field::new(b"x-a", b"1"));
        table.insert(Field::new(b"x-b", b"2"));
        // Newest first: wire 62 is x-b.
        assert_eq!(table.get(62).unwrap().name, b"x-b");
        assert_eq!(table.get(63).unwrap().name, b"x-a");
        assert!(table.get(64).is_none());
    }

    #[test]
    fn eviction_on_overflow() {
        // Each entry is 3 + 1 + 32 = 36 bytes; room for exactly two.
        let mut table = DynamicTable::new(72);
        table.insert(Field::new(b"x-a", b"1"));
        table.insert(Field::new(b"x-b", b"2"));
        table.insert(Field::new(b"x-c", b"3"));
        assert_eq!(table.get(62).unwrap().name, b"x-c");
        assert_eq!(table.get(63).unwrap().name, b"x-b");
        assert!(table.get(64).is_none());
    }

    #[test]
    fn resize_evicts() {
        let mut table = DynamicTable::new(4096);
        table.insert(Field::new(b"x-a", b"1"));
        table.insert(Field::new(b"x-b", b"2"));
        table.resize(40);
        assert_eq!(table.get(62).unwrap().name, b"x-b");
        assert!(table.get(63).is_none());
    }

    #[test]
    fn giant_entry_clears_table() {
        let mut table = DynamicTable::new(64);
        table.insert(Field::new(b"x-a", b"1"));
        table.insert(Field::new(b"giant", vec![b'v'; 128]));
        assert!(table.get(62).is_none());
    }

    #[test]
    fn lookup_priorities() {
        let dynamic = DynamicTable::new(4096);
        assert!(matches!(
            lookup(&dynamic, &Field::new(b":method", b"GET")),
            Lookup::Full(2)
        ));
        assert!(matches!(
            lookup(&dynamic, &Field::new(b":path", b"/nope")),
            Lookup::Name(4)
        ));
        assert!(matches!(
            lookup(&dynamic, &Field::new(b"x-novel", b"v")),
            Lookup::Miss
        ));
    }
}
