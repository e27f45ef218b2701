/// topic 是否含有通配符
pub fn filter_has_wildcards(filter: &str) -> bool {
    filter.contains('+') || filter.contains('#')
}

/// 发布使用的 topic 不能为空，不能含有通配符和空字符
pub fn valid_publish_topic(topic: &str) -> bool {
    !topic.is_empty() && !filter_has_wildcards(topic) && !topic.contains('\0')
}

pub fn valid_subscribe_filter(filter: &str) -> bool {
    // 不可以订阅空 filter
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }

    let levels = filter.split('/').collect::<Vec<&str>>();
    if let Some((last, remaining)) = levels.split_last() {
        for level in remaining.iter() {
            // # 字符只能在最后一层
            if level.contains('#') {
                return false;
            }
            // + 字符必须独占一层
            if level.len() != 1 && level.contains('+') {
                return false;
            }
        }

        // 最后一层的通配符必须独占一层
        if last.len() != 1 && (last.contains('#') || last.contains('+')) {
            return false;
        }
    }

    true
}

/// 匹配发布消息使用的 topic 和 订阅的 filter
pub fn matches(topic: &str, filter: &str) -> bool {
    // 以 $ 开头的 topic 不能被以通配符开头的 filter 匹配
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut topics = topic.split('/');
    let filters = filter.split('/');

    for f in filters {
        // # 字符匹配父级及所有子级
        if f == "#" {
            return true;
        }

        match topics.next() {
            // + 字符直接匹配这一层
            Some(_) if f == "+" => continue,
            // 没有通配符，必须完全匹配
            Some(t) if f != t => return false,
            Some(_) => continue,
            // topic 层级不够了
            None => return false,
        }
    }

    // filter 层级不够了
    topics.next().is_none()
}
