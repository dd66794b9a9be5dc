use learntrail_schemas::{
    generate_activity_id, Activity, ActivityContent, ActivityMetadata, ActivityType,
    BrowsingMetadata, ClassificationResult, CodingMetadata, GamingMetadata, MetadataDetails,
    Observation, ReadingMetadata, ShoppingMetadata, WatchingMetadata,
};
use tracing::debug;
use url::Url;

// ============================================================================
// Keyword tables
// ============================================================================

pub(crate) const EDITOR_APPS: &[&str] = &[
    "code",
    "visual studio",
    "cursor",
    "intellij",
    "pycharm",
    "webstorm",
    "goland",
    "rustrover",
    "clion",
    "xcode",
    "android studio",
    "sublime",
    "vim",
    "emacs",
    "zed",
    "terminal",
    "iterm",
    "warp",
    "alacritty",
    "kitty",
];

const READER_APPS: &[&str] = &[
    "preview", "acrobat", "pdf", "kindle", "books", "okular", "evince", "zathura", "skim",
];

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "epub", "djvu", "mobi"];

const VIDEO_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "twitch.tv",
    "netflix.com",
    "dailymotion.com",
];

const PLAYER_APPS: &[&str] = &["vlc", "iina", "mpv", "quicktime", "media player"];

const GAME_KEYWORDS: &[&str] = &[
    "steam",
    "epic games",
    "battle.net",
    "minecraft",
    "roblox",
    "league of legends",
    "game",
];

const BROWSER_APPS: &[&str] = &[
    "chrome", "firefox", "safari", "edge", "brave", "arc", "opera", "vivaldi",
];

const FRAMEWORK_KEYWORDS: &[&str] = &[
    "react",
    "vue",
    "angular",
    "svelte",
    "nextjs",
    "django",
    "flask",
    "fastapi",
    "express",
    "spring",
    "rails",
    "laravel",
    "tokio",
    "axum",
    "actix",
    "pytorch",
    "tensorflow",
    "electron",
    "tailwind",
];

/// Parents whose next path segment names the project.
const PROJECT_PARENTS: &[&str] = &["code", "projects", "workspace", "work", "src"];

const LANGUAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("swift", "swift"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("hpp", "cpp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("cs", "csharp"),
    ("html", "html"),
    ("css", "css"),
    ("scss", "css"),
    ("sql", "sql"),
    ("sh", "shell"),
];

// ============================================================================
// Activity type inference
// ============================================================================

/// Lowercased view of an observation used by the inference table.
pub struct Signals {
    app: String,
    title: String,
    host: Option<String>,
    path: Option<String>,
}

impl Signals {
    fn from_observation(observation: &Observation) -> Self {
        Self {
            app: observation.app_name.to_lowercase(),
            title: observation.window_title.to_lowercase(),
            host: observation.url.as_deref().and_then(url_host),
            path: observation.file_path.as_ref().map(|p| p.to_lowercase()),
        }
    }

    fn app_matches(&self, table: &[&str]) -> bool {
        table.iter().any(|k| self.app.contains(k))
    }

    fn host_in(&self, domains: &[&str]) -> bool {
        self.host
            .as_deref()
            .map(|host| domains.iter().any(|d| crate::whitelist::host_matches(host, d)))
            .unwrap_or(false)
    }

    fn extension(&self) -> Option<String> {
        self.path.as_deref().and_then(file_extension)
    }
}

fn looks_like_coding(s: &Signals) -> bool {
    s.app_matches(EDITOR_APPS)
        || s
            .extension()
            .map(|ext| language_for_extension(&ext).is_some())
            .unwrap_or(false)
}

fn looks_like_reading(s: &Signals) -> bool {
    s.app_matches(READER_APPS)
        || s
            .extension()
            .map(|ext| DOCUMENT_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
        || s.title.contains(".pdf")
}

fn looks_like_watching(s: &Signals) -> bool {
    s.host_in(VIDEO_DOMAINS) || s.app_matches(PLAYER_APPS)
}

fn looks_like_gaming(s: &Signals) -> bool {
    GAME_KEYWORDS
        .iter()
        .any(|k| s.app.contains(k) || s.title.contains(k))
}

fn looks_like_browsing(s: &Signals) -> bool {
    s.host.is_some() || s.app_matches(BROWSER_APPS)
}

/// Inference order, first match wins. Reorder here to change the tie-break.
pub const INFERENCE_ORDER: &[(ActivityType, fn(&Signals) -> bool)] = &[
    (ActivityType::Coding, looks_like_coding),
    (ActivityType::Reading, looks_like_reading),
    (ActivityType::Watching, looks_like_watching),
    (ActivityType::Gaming, looks_like_gaming),
    (ActivityType::Browsing, looks_like_browsing),
];

/// Explicit `source_type` wins, otherwise the inference table decides.
pub fn determine_activity_type(observation: &Observation) -> ActivityType {
    if let Some(tagged) = observation.source_type.as_deref() {
        match tagged.parse::<ActivityType>() {
            Ok(kind) => return kind,
            Err(e) => debug!("Ignoring source_type tag: {}", e),
        }
    }

    let signals = Signals::from_observation(observation);
    INFERENCE_ORDER
        .iter()
        .find(|(_, matches)| matches(&signals))
        .map(|(kind, _)| *kind)
        .unwrap_or(ActivityType::Other)
}

// ============================================================================
// Activity factory
// ============================================================================

/// Builds a fully enriched `Activity` from an observation that passed the gates.
pub struct ActivityFactory;

impl ActivityFactory {
    pub fn from_observation(observation: &Observation, classification: &ClassificationResult) -> Activity {
        let activity_type = determine_activity_type(observation);
        let url = observation.url.clone();
        let file_path = observation.file_path.clone();

        let mut activity = Activity {
            id: generate_activity_id(),
            source_type: observation.source_type.clone(),
            activity_type,
            app_name: observation.app_name.clone(),
            title: observation.window_title.clone(),
            content: ActivityContent::Pending,
            url,
            file_path,
            project_name: None,
            video_id: None,
            game_name: None,
            session_id: None,
            classification: classification.classification,
            confidence: classification.confidence,
            timestamp: observation.timestamp,
            metadata: ActivityMetadata::default(),
        };

        match activity_type {
            ActivityType::Coding => {
                activity.project_name = infer_project_name(
                    observation.file_path.as_deref(),
                    &observation.window_title,
                );
                let language = observation
                    .file_path
                    .as_deref()
                    .and_then(file_extension)
                    .or_else(|| title_filename(&observation.window_title).and_then(|f| file_extension(&f)))
                    .and_then(|ext| language_for_extension(&ext))
                    .map(str::to_string);
                let haystack = format!(
                    "{} {}",
                    observation.window_title,
                    observation.file_path.as_deref().unwrap_or_default()
                );
                activity.metadata.details = MetadataDetails::Coding(CodingMetadata {
                    language,
                    frameworks: detect_frameworks(&haystack),
                    project_type: None,
                });
            }
            ActivityType::Watching => {
                activity.video_id = observation.url.as_deref().and_then(extract_video_id);
                activity.metadata.details = MetadataDetails::Watching(WatchingMetadata {
                    video_id: activity.video_id.clone(),
                    channel: None,
                    platform: observation.url.as_deref().and_then(video_platform),
                });
            }
            ActivityType::Reading => {
                let document_type = observation
                    .file_path
                    .as_deref()
                    .or(observation.url.as_deref())
                    .and_then(file_extension)
                    .map(|ext| document_type_for_extension(&ext).to_string());
                activity.metadata.details = MetadataDetails::Reading(ReadingMetadata {
                    document_type,
                    page_count: None,
                });
            }
            ActivityType::Gaming => {
                let name = game_name_from_title(&observation.window_title)
                    .unwrap_or_else(|| observation.app_name.clone());
                activity.game_name = Some(name.clone());
                activity.metadata.details = MetadataDetails::Gaming(GamingMetadata {
                    game_name: Some(name),
                    platform: None,
                });
            }
            ActivityType::Shopping => {
                let category = observation.url.as_deref().and_then(shopping_category);
                scrub_shopping(&mut activity, category.as_deref());
                activity.metadata.details =
                    MetadataDetails::Shopping(ShoppingMetadata { category });
            }
            ActivityType::Browsing => {
                activity.metadata.details = MetadataDetails::Browsing(BrowsingMetadata {
                    domain: observation.url.as_deref().and_then(domain_of),
                });
            }
            ActivityType::Social
            | ActivityType::Entertainment
            | ActivityType::Work
            | ActivityType::Learning
            | ActivityType::Other => {}
        }

        activity
    }
}

/// Shopping keeps category-level signal only: the product title and full URL are replaced.
fn scrub_shopping(activity: &mut Activity, category: Option<&str>) {
    let host = activity.url.as_deref().and_then(domain_of);
    activity.title = match category {
        Some(category) => format!("Shopping: {}", category),
        None => "Shopping".to_string(),
    };
    activity.url = host.map(|h| format!("https://{}", h));
}

// ============================================================================
// Extraction helpers
// ============================================================================

/// Lowercased host of a URL, tolerating a missing scheme and a trailing dot.
pub fn url_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = Url::parse(raw).or_else(|_| Url::parse(&format!("https://{}", raw))).ok()?;
    parsed
        .host_str()
        .map(|h| h.trim_end_matches('.').to_lowercase())
        .filter(|h| !h.is_empty())
}

/// Host without a leading `www.`, used as the browsing continuity key.
pub fn domain_of(raw: &str) -> Option<String> {
    url_host(raw).map(|host| match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    })
}

pub fn extract_video_id(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let host = parsed.host_str()?.trim_end_matches('.').to_lowercase();

    if crate::whitelist::host_matches(&host, "youtu.be") {
        return parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
    }

    if crate::whitelist::host_matches(&host, "youtube.com") {
        if let Some((_, id)) = parsed.query_pairs().find(|(key, _)| key == "v") {
            return Some(id.into_owned()).filter(|id| !id.is_empty());
        }
        let segments: Vec<&str> = parsed.path_segments().map(|s| s.collect()).unwrap_or_default();
        if let [kind, id, ..] = segments.as_slice() {
            if (*kind == "shorts" || *kind == "embed") && !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }

    None
}

fn video_platform(raw: &str) -> Option<String> {
    let host = url_host(raw)?;
    VIDEO_DOMAINS
        .iter()
        .find(|d| crate::whitelist::host_matches(&host, d))
        .map(|d| match *d {
            "youtu.be" => "youtube".to_string(),
            other => other.split('.').next().unwrap_or(other).to_string(),
        })
}

/// Project from the path segment after a known parent, else from `file - project - Editor` titles.
pub fn infer_project_name(file_path: Option<&str>, window_title: &str) -> Option<String> {
    if let Some(path) = file_path {
        let parts: Vec<&str> = path.split(['/', '\\']).filter(|p| !p.is_empty()).collect();
        // The last segment is the file itself
        let dirs = parts.len().saturating_sub(1);
        for i in 0..dirs {
            if PROJECT_PARENTS.contains(&parts[i].to_lowercase().as_str()) && i + 1 < dirs {
                return Some(parts[i + 1].to_string());
            }
        }
    }

    project_from_title(window_title)
}

fn project_from_title(window_title: &str) -> Option<String> {
    let normalized = window_title.replace(['\u{2014}', '\u{2013}'], "-");
    let parts: Vec<&str> = normalized
        .split(" - ")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() >= 3 {
        Some(parts[parts.len() - 2].trim_start_matches('●').trim().to_string())
    } else {
        None
    }
}

/// First `name.ext` token in a window title with a known source extension.
pub fn title_filename(window_title: &str) -> Option<String> {
    window_title
        .split(|c: char| c.is_whitespace() || c == '\u{25CF}')
        .map(|token| token.trim_matches(|c: char| c == '"' || c == '\'' || c == '(' || c == ')'))
        .find(|token| {
            file_extension(token)
                .map(|ext| language_for_extension(&ext).is_some())
                .unwrap_or(false)
        })
        .map(str::to_string)
}

pub fn file_extension(path: &str) -> Option<String> {
    let name = path.rsplit(['/', '\\']).next()?;
    let name = name.split(['?', '#']).next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    LANGUAGE_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

fn document_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "pdf" => "pdf",
        "epub" | "mobi" => "ebook",
        "doc" | "docx" => "word",
        "md" => "markdown",
        "txt" => "text",
        _ => "document",
    }
}

/// Framework keywords found as whole tokens in `text`.
pub fn detect_frameworks(text: &str) -> Vec<String> {
    let lower = text.to_lowercase().replace("next.js", "nextjs");
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    FRAMEWORK_KEYWORDS
        .iter()
        .filter(|k| tokens.contains(k))
        .map(|k| k.to_string())
        .collect()
}

fn game_name_from_title(window_title: &str) -> Option<String> {
    let name = window_title
        .split(" - ")
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())?;
    Some(name.to_string())
}

/// First alphabetic path segment that is not a product-page marker.
pub fn shopping_category(raw: &str) -> Option<String> {
    const MARKERS: &[&str] = &["dp", "gp", "s", "p", "product", "products", "item", "itm", "ref"];
    let parsed = Url::parse(raw).ok()?;
    let segments = parsed.path_segments()?;
    for segment in segments {
        let segment = segment.to_lowercase();
        if segment.is_empty() || MARKERS.contains(&segment.as_str()) {
            continue;
        }
        if segment.chars().all(|c| c.is_ascii_alphabetic() || c == '-') {
            return Some(segment.replace('-', " "));
        }
    }
    None
}
