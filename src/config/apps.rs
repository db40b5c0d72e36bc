//! App display name to package name registry.

use std::collections::HashMap;

/// Built-in mapping from app display names to Android package names.
const DEFAULT_APPS: &[(&str, &str)] = &[
    // Social & Messaging
    ("微信", "com.tencent.mm"),
    ("QQ", "com.tencent.mobileqq"),
    ("微博", "com.sina.weibo"),
    // E-commerce
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("拼多多", "com.xunmeng.pinduoduo"),
    // Lifestyle & Social
    ("小红书", "com.xingin.xhs"),
    ("知乎", "com.zhihu.android"),
    // Maps & Navigation
    ("高德地图", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    // Food & Services
    ("美团", "com.sankuai.meituan"),
    ("大众点评", "com.dianping.v1"),
    ("饿了么", "me.ele"),
    // Travel
    ("携程", "ctrip.android.view"),
    ("铁路12306", "com.MobileTicket"),
    ("12306", "com.MobileTicket"),
    ("滴滴出行", "com.sdu.did.psnger"),
    // Video & Entertainment
    ("bilibili", "tv.danmaku.bili"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("快手", "com.smile.gifmaker"),
    ("腾讯视频", "com.tencent.qqlive"),
    ("爱奇艺", "com.qiyi.video"),
    // Music & Audio
    ("网易云音乐", "com.netease.cloudmusic"),
    ("QQ音乐", "com.tencent.qqmusic"),
    // Productivity
    ("飞书", "com.ss.android.lark"),
    ("QQ邮箱", "com.tencent.androidqqmail"),
    // System
    ("Settings", "com.android.settings"),
    ("Android System Settings", "com.android.settings"),
    // Common apps (English names)
    ("Chrome", "com.android.chrome"),
    ("Google Chrome", "com.android.chrome"),
    ("Clock", "com.android.deskclock"),
    ("Contacts", "com.android.contacts"),
    ("Gmail", "com.google.android.gm"),
    ("Google Maps", "com.google.android.apps.maps"),
    ("Maps", "com.google.android.apps.maps"),
    ("YouTube", "com.google.android.youtube"),
    ("Camera", "com.android.camera"),
    ("Gallery", "com.android.gallery3d"),
    ("Calculator", "com.android.calculator2"),
    ("Calendar", "com.android.calendar"),
    ("Messages", "com.android.mms"),
    ("Phone", "com.android.dialer"),
];

/// Bidirectional lookup between app display names and package ids.
///
/// Built once per session and handed to the agent loop; there is no
/// process-wide instance. Name lookups ignore ASCII case.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    by_name: HashMap<String, String>,
    by_package: HashMap<String, String>,
}

impl AppRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry seeded with the built-in app table.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, package) in DEFAULT_APPS {
            registry.register(*name, *package);
        }
        registry
    }

    /// Register an app. The first name registered for a package is its display name.
    pub fn register(&mut self, name: impl Into<String>, package: impl Into<String>) {
        let name = name.into();
        let package = package.into();
        self.by_package
            .entry(package.clone())
            .or_insert_with(|| name.clone());
        self.by_name.insert(name.to_lowercase(), package);
    }

    /// Get the package name for an app by its display name.
    pub fn package_for(&self, name: &str) -> Option<&str> {
        self.by_name
            .get(&name.trim().to_lowercase())
            .map(String::as_str)
    }

    /// Get the display name registered for a package.
    pub fn name_for(&self, package: &str) -> Option<&str> {
        self.by_package.get(package).map(String::as_str)
    }

    /// Number of distinct display names.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Whether a string is shaped like an Android package id.
pub fn looks_like_package(value: &str) -> bool {
    let value = value.trim();
    value.contains('.')
        && !value.starts_with('.')
        && !value.ends_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}
