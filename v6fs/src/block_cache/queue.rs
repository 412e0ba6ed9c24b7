//! # 缓存块队列
//!
//! 以下标代替指针的循环双向链表。队头（锚点）与队员是同一种结点，
//! 存放在同一个数组中：前 `n` 个结点对应 `n` 个缓存块，其后是各个队列的锚点。
//!
//! 游离的结点自己指向自己，因此对其重复摘除是无害的。

/// 链表结点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    prev: usize,
    next: usize,
}

/// 一组共用结点数组的循环链表
#[derive(Debug)]
pub struct Chains {
    links: Vec<Link>,
}

impl Chains {
    /// 创建含 `nodes` 个游离结点的结点数组
    pub fn new(nodes: usize) -> Self {
        Self {
            links: (0..nodes).map(|i| Link { prev: i, next: i }).collect(),
        }
    }

    /// 新增一个空队列，返回其锚点
    pub fn add_anchor(&mut self) -> usize {
        let anchor = self.links.len();
        self.links.push(Link {
            prev: anchor,
            next: anchor,
        });
        anchor
    }

    /// 结点是否挂在某个队列上
    pub fn is_linked(&self, node: usize) -> bool {
        self.links[node].next != node
    }

    /// 从所在队列摘除结点
    pub fn unlink(&mut self, node: usize) {
        let Link { prev, next } = self.links[node];
        self.links[prev].next = next;
        self.links[next].prev = prev;
        self.links[node] = Link {
            prev: node,
            next: node,
        };
    }

    /// 插入队头
    pub fn push_front(&mut self, anchor: usize, node: usize) {
        self.unlink(node);
        let next = self.links[anchor].next;
        self.links[node] = Link { prev: anchor, next };
        self.links[next].prev = node;
        self.links[anchor].next = node;
    }

    /// 插入队尾
    pub fn push_back(&mut self, anchor: usize, node: usize) {
        self.unlink(node);
        let prev = self.links[anchor].prev;
        self.links[node] = Link { prev, next: anchor };
        self.links[prev].next = node;
        self.links[anchor].prev = node;
    }

    /// 队头结点
    pub fn first(&self, anchor: usize) -> Option<usize> {
        let next = self.links[anchor].next;
        (next != anchor).then_some(next)
    }

    /// 自队头向队尾遍历
    pub fn iter(&self, anchor: usize) -> Iter<'_> {
        Iter {
            chains: self,
            anchor,
            cursor: self.links[anchor].next,
        }
    }

    /// 检查队列是否是合法的循环链表：前后指针互相吻合，且结点不重复
    #[cfg(test)]
    pub fn is_consistent(&self, anchor: usize) -> bool {
        let mut seen = vec![false; self.links.len()];
        let mut node = anchor;
        loop {
            let next = self.links[node].next;
            if self.links[next].prev != node {
                return false;
            }
            if next == anchor {
                return true;
            }
            if seen[next] {
                return false;
            }
            seen[next] = true;
            node = next;
        }
    }
}

pub struct Iter<'a> {
    chains: &'a Chains,
    anchor: usize,
    cursor: usize,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == self.anchor {
            return None;
        }
        let node = self.cursor;
        self.cursor = self.chains.links[node].next;
        Some(node)
    }
}
