//! 멤버 레지스트리와 그룹 소속
//!
//! 연결된 모든 멤버와 그룹별 멤버 집합을 가진다. 멤버는 최대 한 그룹에만 속한다.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::member::{Member, MemberId};
use crate::{Error, Result};

/// 그룹 ID
pub type GroupId = u32;

/// 멤버/그룹 레지스트리
#[derive(Debug, Default)]
pub struct GroupMembership {
    members: DashMap<MemberId, Arc<Member>>,
    groups: DashMap<GroupId, BTreeSet<MemberId>>,
}

impl GroupMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// 연결된 멤버 등록
    pub fn register(&self, member: Arc<Member>) {
        self.members.insert(member.id, member);
    }

    /// 멤버 등록 해제 (그룹에서도 제거)
    pub fn unregister(&self, id: MemberId) -> Option<Arc<Member>> {
        self.leave(id);
        self.members.remove(&id).map(|(_, member)| member)
    }

    pub fn get(&self, id: MemberId) -> Option<Arc<Member>> {
        self.members.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// 살아있는 멤버만
    pub fn get_live(&self, id: MemberId) -> Option<Arc<Member>> {
        self.get(id).filter(|member| !member.is_disposed())
    }

    /// 그룹 참가. 기존 멤버 목록(자신 제외) 반환
    pub fn join(&self, id: MemberId, group: GroupId) -> Result<Vec<MemberId>> {
        let member = self.get_live(id).ok_or(Error::UnknownMember(id))?;
        if let Some(current) = member.group() {
            return Err(Error::AlreadyInGroup {
                member: id,
                group: current,
            });
        }

        let mut set = self.groups.entry(group).or_default();
        let existing: Vec<MemberId> = set.iter().copied().collect();
        set.insert(id);
        drop(set);

        member.set_group(Some(group));
        debug!("멤버 {} 그룹 {} 참가 (기존 {}명)", id, group, existing.len());
        Ok(existing)
    }

    /// 그룹 이탈. (그룹, 남은 멤버) 반환
    pub fn leave(&self, id: MemberId) -> Option<(GroupId, Vec<MemberId>)> {
        let member = self.get(id)?;
        let group = member.group()?;
        member.set_group(None);

        let mut remaining = Vec::new();
        let empty = match self.groups.get_mut(&group) {
            Some(mut set) => {
                set.remove(&id);
                remaining.extend(set.iter().copied());
                set.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove_if(&group, |_, set| set.is_empty());
        }

        debug!("멤버 {} 그룹 {} 이탈 (남은 {}명)", id, group, remaining.len());
        Some((group, remaining))
    }

    /// 그룹 멤버 목록
    pub fn members_of(&self, group: GroupId) -> Vec<MemberId> {
        self.groups
            .get(&group)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 같은 그룹의 다른 멤버
    pub fn peers_of(&self, id: MemberId) -> Vec<MemberId> {
        self.get(id)
            .and_then(|member| member.group())
            .map(|group| {
                self.members_of(group)
                    .into_iter()
                    .filter(|peer| *peer != id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 두 멤버가 같은 그룹인지
    pub fn same_group(&self, a: MemberId, b: MemberId) -> bool {
        match (self.get(a).and_then(|m| m.group()), self.get(b).and_then(|m| m.group())) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => false,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// 모든 멤버 스냅샷
    pub fn all_members(&self) -> Vec<Arc<Member>> {
        self.members
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
