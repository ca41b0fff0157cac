// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Orders tags the way their `name:value` renderings sort, without rendering them.
    fn canonical_cmp(&self, other: &Self) -> Ordering {
        let lhs = self.name.bytes().chain(*b":").chain(self.value.bytes());
        let rhs = other.name.bytes().chain(*b":").chain(other.value.bytes());
        lhs.cmp(rhs)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// Tags kept in canonical order: sorted on their `name:value` rendering, duplicates removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TagSet(Vec<Tag>);

impl TagSet {
    pub fn new(mut tags: Vec<Tag>) -> Self {
        tags.sort_by(Tag::canonical_cmp);
        tags.dedup();
        Self(tags)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    /// Value of the first tag named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.as_str())
    }

    /// Canonical `name:value,name:value` form.
    pub fn tag_key(&self) -> String {
        let mut key = String::new();
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                key.push(',');
            }
            key.push_str(&tag.name);
            key.push(':');
            key.push_str(&tag.value);
        }
        key
    }

    /// Key of the aggregation of `metric` over this tag set.
    pub fn key(&self, metric: &str) -> String {
        format!("{}|{metric}", self.tag_key())
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
