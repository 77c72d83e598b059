//! Thread tree construction and depth-annotated slicing.
//!
//! Tree building and slicing are pure over loaded post rows, so the
//! expensive per-node hydration can fan out afterwards over exactly the
//! nodes a slice selected. Parents missing from the loaded set become
//! sentinel nodes whose URI and CID are recovered from the child's embedded
//! reply reference.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use lantern_atproto::record_uri;
use lantern_atproto::records::POST_COLLECTION;
use lantern_index::models::Post;

#[derive(Debug)]
pub struct ThreadNode {
    /// The loaded row; `None` marks a missing-parent sentinel.
    pub post: Option<Post>,
    pub uri: String,
    pub cid: Option<String>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl ThreadNode {
    pub fn is_missing(&self) -> bool {
        self.post.is_none()
    }
}

#[derive(Debug)]
pub struct ThreadTree {
    nodes: Vec<ThreadNode>,
    by_post_id: HashMap<i64, usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadSliceItem {
    pub node: usize,
    pub depth: i64,
}

#[derive(Debug)]
pub struct ThreadSlice {
    /// Ancestors at negative depth (nearest first), the anchor at depth 0,
    /// then descendants in depth-first order.
    pub items: Vec<ThreadSliceItem>,
    /// Whether the branching factor trimmed any replies away.
    pub has_other_replies: bool,
}

impl ThreadTree {
    /// Build a tree from the posts of one thread by `reply_to` edges.
    /// `dids` maps author ids to DIDs for URI construction.
    pub fn build(posts: Vec<Post>, dids: &HashMap<i64, String>) -> Self {
        let mut nodes: Vec<ThreadNode> = Vec::with_capacity(posts.len());
        let mut by_post_id: HashMap<i64, usize> = HashMap::with_capacity(posts.len());

        for post in posts {
            let uri = match dids.get(&post.author) {
                Some(did) => record_uri(did, POST_COLLECTION, &post.rkey),
                None => {
                    warn!(post = post.id, author = post.author, "post author missing from did map");
                    continue;
                }
            };
            let idx = nodes.len();
            by_post_id.insert(post.id, idx);
            nodes.push(ThreadNode {
                cid: Some(post.cid.clone()).filter(|c| !c.is_empty()),
                uri,
                post: Some(post),
                parent: None,
                children: Vec::new(),
            });
        }

        // Link children to parents, synthesizing sentinels for parents
        // outside the loaded set.
        let mut missing_by_id: HashMap<i64, usize> = HashMap::new();
        for idx in 0..nodes.len() {
            let (reply_to, raw) = match nodes[idx].post.as_ref() {
                Some(post) if post.reply_to != 0 => (post.reply_to, post.raw.clone()),
                _ => continue,
            };

            let parent_idx = if let Some(&p) = by_post_id.get(&reply_to) {
                p
            } else if let Some(&p) = missing_by_id.get(&reply_to) {
                p
            } else {
                let (uri, cid) = parent_ref_from_raw(raw.as_deref());
                let p = nodes.len();
                nodes.push(ThreadNode {
                    post: None,
                    uri,
                    cid,
                    parent: None,
                    children: Vec::new(),
                });
                missing_by_id.insert(reply_to, p);
                p
            };

            nodes[idx].parent = Some(parent_idx);
            nodes[parent_idx].children.push(idx);
        }

        for (post_id, idx) in missing_by_id {
            by_post_id.insert(post_id, idx);
        }

        Self { nodes, by_post_id }
    }

    pub fn node(&self, idx: usize) -> &ThreadNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, post_id: i64) -> Option<usize> {
        self.by_post_id.get(&post_id).copied()
    }

    /// Produce the depth-annotated flat list around an anchor: ancestors at
    /// −1, −2, ... (stopping at a missing sentinel), the anchor at 0, then
    /// descendants newest-first down to `below` levels with at most
    /// `branching_factor` children per node.
    pub fn slice(
        &self,
        anchor_post_id: i64,
        above: bool,
        below: i64,
        branching_factor: i64,
    ) -> Option<ThreadSlice> {
        let anchor = self.index_of(anchor_post_id)?;

        let mut items = Vec::new();
        let mut has_other_replies = false;

        if above {
            let mut parent = self.nodes[anchor].parent;
            let mut depth = -1i64;
            let mut ancestors = Vec::new();
            while let Some(idx) = parent {
                ancestors.push(ThreadSliceItem { node: idx, depth });
                if self.nodes[idx].is_missing() {
                    break;
                }
                parent = self.nodes[idx].parent;
                depth -= 1;
            }
            items.extend(ancestors);
        }

        items.push(ThreadSliceItem {
            node: anchor,
            depth: 0,
        });

        if below > 0 {
            self.collect_replies(
                anchor,
                0,
                below,
                branching_factor,
                &mut items,
                &mut has_other_replies,
            );
        }

        Some(ThreadSlice {
            items,
            has_other_replies,
        })
    }

    fn collect_replies(
        &self,
        node: usize,
        depth: i64,
        below: i64,
        branching_factor: i64,
        out: &mut Vec<ThreadSliceItem>,
        has_other_replies: &mut bool,
    ) {
        if below == 0 {
            return;
        }

        let mut children = self.nodes[node].children.clone();
        // Newest first.
        children.sort_by(|&a, &b| {
            let ca = self.nodes[a].post.as_ref().map(|p| p.created);
            let cb = self.nodes[b].post.as_ref().map(|p| p.created);
            cb.cmp(&ca)
        });

        if children.len() as i64 > branching_factor {
            *has_other_replies = true;
            children.truncate(branching_factor as usize);
        }

        for child in children {
            out.push(ThreadSliceItem {
                node: child,
                depth: depth + 1,
            });
            if self.nodes[child].is_missing() {
                continue;
            }
            self.collect_replies(
                child,
                depth + 1,
                below - 1,
                branching_factor,
                out,
                has_other_replies,
            );
        }
    }
}

/// Recover the parent's URI and CID from a reply's stored record.
fn parent_ref_from_raw(raw: Option<&[u8]>) -> (String, Option<String>) {
    let Some(raw) = raw else {
        return (String::new(), None);
    };
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return (String::new(), None);
    };
    let parent = &value["reply"]["parent"];
    let uri = parent["uri"].as_str().unwrap_or_default().to_string();
    let cid = parent["cid"].as_str().map(String::from);
    (uri, cid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn mk_post(id: i64, author: i64, reply_to: i64, in_thread: i64, minutes: i64) -> Post {
        Post {
            id,
            author,
            rkey: format!("rkey{id}"),
            cid: format!("bafy{id}"),
            not_found: false,
            raw: Some(b"{\"text\":\"x\",\"createdAt\":\"2024-05-01T12:00:00Z\"}".to_vec()),
            created: base_time() + Duration::minutes(minutes),
            indexed: base_time(),
            reposting: 0,
            reply_to,
            reply_to_usr: 0,
            in_thread,
        }
    }

    fn did_map(authors: &[i64]) -> HashMap<i64, String> {
        authors
            .iter()
            .map(|&a| (a, format!("did:plc:user{a}")))
            .collect()
    }

    #[test]
    fn test_build_links_children() {
        let posts = vec![
            mk_post(1, 10, 0, 0, 0),
            mk_post(2, 11, 1, 1, 1),
            mk_post(3, 12, 1, 1, 2),
            mk_post(4, 11, 2, 1, 3),
        ];
        let tree = ThreadTree::build(posts, &did_map(&[10, 11, 12]));

        let root = tree.index_of(1).unwrap();
        assert_eq!(tree.node(root).children.len(), 2);
        let reply = tree.index_of(2).unwrap();
        assert_eq!(tree.node(reply).parent, Some(root));
        assert_eq!(tree.node(reply).children.len(), 1);
    }

    #[test]
    fn test_slice_ancestors_have_negative_depths() {
        // 1 <- 2 <- 3, anchored at 3.
        let posts = vec![
            mk_post(1, 10, 0, 0, 0),
            mk_post(2, 10, 1, 1, 1),
            mk_post(3, 10, 2, 1, 2),
        ];
        let tree = ThreadTree::build(posts, &did_map(&[10]));
        let slice = tree.slice(3, true, 6, 10).unwrap();

        let depths: Vec<i64> = slice.items.iter().map(|i| i.depth).collect();
        assert_eq!(depths, vec![-1, -2, 0]);
        assert_eq!(
            tree.node(slice.items[0].node).post.as_ref().unwrap().id,
            2
        );
        assert_eq!(
            tree.node(slice.items[1].node).post.as_ref().unwrap().id,
            1
        );
    }

    #[test]
    fn test_slice_without_above() {
        let posts = vec![mk_post(1, 10, 0, 0, 0), mk_post(2, 10, 1, 1, 1)];
        let tree = ThreadTree::build(posts, &did_map(&[10]));
        let slice = tree.slice(2, false, 6, 10).unwrap();
        assert_eq!(slice.items[0].depth, 0);
        assert_eq!(slice.items.len(), 1);
    }

    #[test]
    fn test_missing_parent_becomes_sentinel_and_stops_walk() {
        // Post 5 replies to post 99, which is not loaded; its raw record
        // carries the parent reference.
        let mut reply = mk_post(5, 10, 99, 99, 0);
        reply.raw = Some(
            br#"{"text":"r","createdAt":"2024-05-01T12:00:00Z","reply":{"parent":{"uri":"at://did:plc:gone/app.bsky.feed.post/x","cid":"bafygone"},"root":{"uri":"at://did:plc:gone/app.bsky.feed.post/x","cid":"bafygone"}}}"#
                .to_vec(),
        );
        let tree = ThreadTree::build(vec![reply], &did_map(&[10]));

        let slice = tree.slice(5, true, 6, 10).unwrap();
        assert_eq!(slice.items.len(), 2);
        assert_eq!(slice.items[0].depth, -1);
        let sentinel = tree.node(slice.items[0].node);
        assert!(sentinel.is_missing());
        assert_eq!(sentinel.uri, "at://did:plc:gone/app.bsky.feed.post/x");
        assert_eq!(sentinel.cid.as_deref(), Some("bafygone"));
        assert_eq!(slice.items[1].depth, 0);
    }

    #[test]
    fn test_slice_depth_and_branching_limits() {
        // Root (id 1) with a 4-deep chain of reply fans: each node at depth
        // 1..4 has several children; 50 posts in total.
        let mut posts = vec![mk_post(1, 10, 0, 0, 0)];
        let mut next_id = 2;
        // depth 1: 7 replies to root
        let mut level = Vec::new();
        for i in 0..7 {
            posts.push(mk_post(next_id, 10, 1, 1, i));
            level.push(next_id);
            next_id += 1;
        }
        // depths 2..4: 2 replies under each node of the previous level,
        // until we run out of our 50-post budget.
        for _depth in 2..=4 {
            let mut next_level = Vec::new();
            for &parent in &level {
                for i in 0..2 {
                    if posts.len() >= 50 {
                        break;
                    }
                    posts.push(mk_post(next_id, 10, parent, 1, i));
                    next_level.push(next_id);
                    next_id += 1;
                }
            }
            level = next_level;
        }

        let tree = ThreadTree::build(posts, &did_map(&[10]));
        let slice = tree.slice(1, true, 2, 3).unwrap();

        // Only depths 0..=2 survive, and trimming was flagged (root has 7
        // children, branching factor 3).
        assert!(slice.items.iter().all(|i| (0..=2).contains(&i.depth)));
        assert!(slice.has_other_replies);

        let depth1_count = slice.items.iter().filter(|i| i.depth == 1).count();
        assert_eq!(depth1_count, 3);

        // No node contributes more than 3 direct children.
        let mut children_per_parent: HashMap<usize, usize> = HashMap::new();
        for item in &slice.items {
            if item.depth > 0 {
                let parent = tree.node(item.node).parent.unwrap();
                *children_per_parent.entry(parent).or_default() += 1;
            }
        }
        assert!(children_per_parent.values().all(|&c| c <= 3));
    }

    #[test]
    fn test_slice_children_are_newest_first() {
        let posts = vec![
            mk_post(1, 10, 0, 0, 0),
            mk_post(2, 10, 1, 1, 5),
            mk_post(3, 10, 1, 1, 10),
            mk_post(4, 10, 1, 1, 1),
        ];
        let tree = ThreadTree::build(posts, &did_map(&[10]));
        let slice = tree.slice(1, false, 1, 10).unwrap();

        let order: Vec<i64> = slice.items[1..]
            .iter()
            .map(|i| tree.node(i.node).post.as_ref().unwrap().id)
            .collect();
        assert_eq!(order, vec![3, 2, 4]);
    }

    #[test]
    fn test_slice_unknown_anchor() {
        let tree = ThreadTree::build(vec![mk_post(1, 10, 0, 0, 0)], &did_map(&[10]));
        assert!(tree.slice(42, true, 6, 10).is_none());
    }
}
