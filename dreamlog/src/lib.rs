//! Dream and journal entry store.
//!
//! Entries are plain text files laid out as `root/YEAR/Month/DAY/<Title>_<stamp>.txt`.
//! The library owns the entry text format, the newest-first index over that tree, and the
//! idempotent import ("sync") of flat-text exports into it. Terminal presentation lives in
//! the binary.

pub mod core {
    use crate::dates::{self, DirtyDate};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    /* ------------------------------ Constants ------------------------------ */

    /// Rule printed under the header line and around the dream metadata.
    pub const SEPARATOR: &str = "───────────────────────────────────────────────────────────────────────";

    /// Block delimiter used by sync input and backup files (exactly 30 `=`).
    pub const DELIMITER: &str = "==============================";

    /// Extension of every stored entry file.
    pub const ENTRY_EXTENSION: &str = "txt";

    /* ------------------------------- Kinds ------------------------------- */

    /// The two independently rooted stores. They share mechanics; only dreams carry metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum EntryKind {
        Dream,
        Journal,
    }

    impl EntryKind {
        /// Marker line that opens the body of a freshly created entry.
        pub fn marker(self) -> &'static str {
            match self {
                EntryKind::Dream => "[ Dream Entry ]",
                EntryKind::Journal => "[ Journal Entry ]",
            }
        }

        pub fn label(self) -> &'static str {
            match self {
                EntryKind::Dream => "Dream",
                EntryKind::Journal => "Journal",
            }
        }

        pub fn untitled(self) -> &'static str {
            match self {
                EntryKind::Dream => "Untitled Dream",
                EntryKind::Journal => "Untitled Journal",
            }
        }
    }

    impl fmt::Display for EntryKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.label())
        }
    }

    /* ------------------------------ Records ------------------------------ */

    /// One journal or dream entry, as stored in a single text file.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EntryRecord {
        pub title: String,
        /// Canonical form `"D Month, YYYY"`.
        pub display_date: String,
        pub body: String,
        /// Present for dream entries only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub dream: Option<DreamFields>,
    }

    impl EntryRecord {
        pub fn journal(
            title: impl Into<String>,
            display_date: impl Into<String>,
            body: impl Into<String>,
        ) -> Self {
            Self {
                title: title.into(),
                display_date: display_date.into(),
                body: body.into(),
                dream: None,
            }
        }

        pub fn dream(
            title: impl Into<String>,
            display_date: impl Into<String>,
            body: impl Into<String>,
            fields: DreamFields,
        ) -> Self {
            Self {
                title: title.into(),
                display_date: display_date.into(),
                body: body.into(),
                dream: Some(fields),
            }
        }

        pub fn kind(&self) -> EntryKind {
            if self.dream.is_some() {
                EntryKind::Dream
            } else {
                EntryKind::Journal
            }
        }

        /// Render the canonical on-disk text.
        pub fn format(&self) -> String {
            crate::format::format_entry(self)
        }

        /// Inverse of [`EntryRecord::format`].
        pub fn parse(text: &str, kind: EntryKind) -> Result<Self, MalformedEntry> {
            crate::parser::parse_entry(text, kind)
        }

        /// Every `-[TAG]-` marker in the body, in order of appearance.
        pub fn tags(&self) -> Vec<String> {
            crate::parser::extract_tags(&self.body)
        }

        /// Calendar date behind `display_date`.
        pub fn date(&self) -> Result<NaiveDate, DirtyDate> {
            dates::parse_display_date(&self.display_date)
        }
    }

    /// The three categorical lines of a dream entry, kept verbatim so files round-trip.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DreamFields {
        pub dream_type: String,
        pub technique: String,
        pub sleep_cycle: String,
    }

    impl DreamFields {
        pub fn new(
            dream_type: impl Into<String>,
            technique: impl Into<String>,
            sleep_cycle: impl Into<String>,
        ) -> Self {
            Self {
                dream_type: dream_type.into(),
                technique: technique.into(),
                sleep_cycle: sleep_cycle.into(),
            }
        }

        pub fn from_values(
            types: &[DreamType],
            technique: Technique,
            sleep_cycle: SleepCycle,
        ) -> Self {
            let dream_type = types
                .iter()
                .map(|t| t.label())
                .collect::<Vec<_>>()
                .join(", ");
            Self::new(dream_type, technique.label(), sleep_cycle.label())
        }

        /// Recognized members of `dream_type`; unknown values are left out.
        pub fn dream_types(&self) -> Vec<DreamType> {
            split_values(&self.dream_type)
                .filter_map(|value| value.parse().ok())
                .collect()
        }
    }

    /// Values of a multi-valued field, which joins them with `", "`.
    pub fn split_values(field: &str) -> impl Iterator<Item = &str> {
        field.split(',').map(str::trim).filter(|value| !value.is_empty())
    }

    /* ---------------------------- Vocabularies ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum DreamType {
        Lucid,
        Vivid,
        Nightmare,
        Vague,
        Vivimax,
        NoRecall,
        Normal,
        NotApplicable,
        Ie,
    }

    impl DreamType {
        pub const ALL: [DreamType; 9] = [
            DreamType::Lucid,
            DreamType::Vivid,
            DreamType::Nightmare,
            DreamType::Vague,
            DreamType::Vivimax,
            DreamType::NoRecall,
            DreamType::Normal,
            DreamType::NotApplicable,
            DreamType::Ie,
        ];

        pub fn label(self) -> &'static str {
            match self {
                DreamType::Lucid => "Lucid",
                DreamType::Vivid => "Vivid",
                DreamType::Nightmare => "Nightmare",
                DreamType::Vague => "Vague",
                DreamType::Vivimax => "Vivimax",
                DreamType::NoRecall => "No Recall",
                DreamType::Normal => "Normal",
                DreamType::NotApplicable => "N/A",
                DreamType::Ie => "IE",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Technique {
        Wild,
        Dild,
        Mild,
        Ssild,
        NotApplicable,
    }

    impl Technique {
        pub const ALL: [Technique; 5] = [
            Technique::Wild,
            Technique::Dild,
            Technique::Mild,
            Technique::Ssild,
            Technique::NotApplicable,
        ];

        pub fn label(self) -> &'static str {
            match self {
                Technique::Wild => "WILD",
                Technique::Dild => "DILD",
                Technique::Mild => "MILD",
                Technique::Ssild => "SSILD",
                Technique::NotApplicable => "N/A",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum SleepCycle {
        Regular,
        Wbtb,
        Nap,
        NotApplicable,
    }

    impl SleepCycle {
        pub const ALL: [SleepCycle; 4] = [
            SleepCycle::Regular,
            SleepCycle::Wbtb,
            SleepCycle::Nap,
            SleepCycle::NotApplicable,
        ];

        pub fn label(self) -> &'static str {
            match self {
                SleepCycle::Regular => "Regular",
                SleepCycle::Wbtb => "WBTB",
                SleepCycle::Nap => "Nap",
                SleepCycle::NotApplicable => "N/A",
            }
        }
    }

    /// Loose key for matching user input: case, spaces, `-`, `_` and `/` are ignored.
    fn vocab_key(s: &str) -> String {
        s.chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_' | '/'))
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }

    macro_rules! vocabulary_traits {
        ($ty:ident, $what:literal) => {
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.label())
                }
            }

            impl FromStr for $ty {
                type Err = UnknownValue;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    let key = vocab_key(s.trim());
                    $ty::ALL
                        .into_iter()
                        .find(|v| vocab_key(v.label()) == key)
                        .ok_or_else(|| UnknownValue {
                            what: $what,
                            value: s.to_string(),
                        })
                }
            }
        };
    }

    vocabulary_traits!(DreamType, "dream type");
    vocabulary_traits!(Technique, "technique");
    vocabulary_traits!(SleepCycle, "sleep cycle");

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// A stored file that cannot be read back into an [`EntryRecord`].
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum MalformedEntry {
        #[error("first line is not a `[ (title) | (date) ]` header")]
        MissingHeader,
        #[error("expected 3 metadata lines, found {0}")]
        MissingMetadata(usize),
        #[error("metadata line {line} is not `Field: value`")]
        BadField { line: usize },
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("unknown {what} {value:?}")]
    pub struct UnknownValue {
        pub what: &'static str,
        pub value: String,
    }

}

pub mod dates {
    //! Conversions between the display date (`"5 March, 2024"`) and sortable forms.
    //!
    //! Failures are values, not panics: batch loops branch on [`DirtyDate`] and carry on.

    use chrono::{Datelike, NaiveDate};
    use std::fmt;

    const MONTHS: [&str; 12] = [
        "January",
        "February",
        "March",
        "April",
        "May",
        "June",
        "July",
        "August",
        "September",
        "October",
        "November",
        "December",
    ];

    /// `"March"` -> 3. English names only; case is ignored.
    pub fn month_number(name: &str) -> Option<u32> {
        MONTHS
            .iter()
            .position(|m| m.eq_ignore_ascii_case(name))
            .map(|idx| idx as u32 + 1)
    }

    /// 3 -> `"March"`.
    pub fn month_name(number: u32) -> Option<&'static str> {
        let idx = number.checked_sub(1)? as usize;
        MONTHS.get(idx).copied()
    }

    /// Which token comes first before the comma.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateOrder {
        /// `"5 March, 2024"`: stored entries and sync input.
        DayFirst,
        /// `"March 5, 2024"`: older journal exports.
        MonthFirst,
    }

    /// A validated year/month/day triple. Displays as `YYYY-MM-DD`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct DateParts {
        pub year: i32,
        pub month: u32,
        pub day: u32,
    }

    impl DateParts {
        /// Day is only range-checked (1..=31) during parsing; this rejects e.g. 31 February.
        pub fn to_naive(self) -> Result<NaiveDate, DirtyDate> {
            NaiveDate::from_ymd_opt(self.year, self.month, self.day)
                .ok_or(DirtyDate::NotACalendarDate(self))
        }
    }

    impl fmt::Display for DateParts {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DirtyDate {
        #[error("expected `<day> <month>, <year>`, got {0:?}")]
        Shape(String),
        #[error("unknown month name {0:?}")]
        UnknownMonth(String),
        #[error("day {0:?} is not within 1..=31")]
        DayOutOfRange(String),
        #[error("year {0:?} is not a number")]
        BadYear(String),
        #[error("{0} is not a calendar date")]
        NotACalendarDate(DateParts),
    }

    /// Parse a display date into its sortable parts.
    ///
    /// `trailing_bracket` handles a legacy export where the year carried a stray `)`.
    pub fn to_sortable(
        raw: &str,
        order: DateOrder,
        trailing_bracket: bool,
    ) -> Result<DateParts, DirtyDate> {
        let shape = || DirtyDate::Shape(raw.to_string());

        let mut parts = raw.split(',');
        let (Some(day_month), Some(year), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(shape());
        };

        let day_month = day_month.trim();
        let day_month = day_month.strip_prefix('(').unwrap_or(day_month);
        let mut year = year.trim();
        if trailing_bracket {
            year = year.strip_suffix(|c: char| c == ')' || c == ']').unwrap_or(year);
        }

        let mut tokens = day_month.split_whitespace();
        let (Some(first), Some(second), None) = (tokens.next(), tokens.next(), tokens.next())
        else {
            return Err(shape());
        };
        let (day, month) = match order {
            DateOrder::DayFirst => (first, second),
            DateOrder::MonthFirst => (second, first),
        };

        let month = month_number(month).ok_or_else(|| DirtyDate::UnknownMonth(month.to_string()))?;
        let day = parse_digits(day)
            .filter(|d| (1..=31).contains(d))
            .ok_or_else(|| DirtyDate::DayOutOfRange(day.to_string()))?;
        let year = parse_digits(year)
            .and_then(|y| i32::try_from(y).ok())
            .ok_or_else(|| DirtyDate::BadYear(year.to_string()))?;

        Ok(DateParts { year, month, day })
    }

    fn parse_digits(s: &str) -> Option<u32> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    }

    /// Parse the canonical stored form (`DayFirst`, no legacy bracket).
    pub fn parse_display_date(raw: &str) -> Result<NaiveDate, DirtyDate> {
        to_sortable(raw, DateOrder::DayFirst, false)?.to_naive()
    }

    /// `2024-03-05` -> `"5 March, 2024"` (no zero padding on the day).
    pub fn display_date(date: NaiveDate) -> String {
        format!(
            "{} {}, {}",
            date.day(),
            month_name(date.month()).unwrap_or(""),
            date.year()
        )
    }

}

pub mod parser {
    //! Line-oriented reader for stored entries.
    //!
    //! The header and `Field: value` lines are parsed with `nom`; everything after the fixed
    //! preamble is body text. Separator rules and the kind's marker line are dropped from the
    //! body so a freshly created entry reads back as just its content.

    use crate::core::*;
    use nom::{
        IResult,
        bytes::complete::{tag, take_until},
        character::complete::{char, space0},
        combinator::{all_consuming, rest},
        error::{VerboseError, VerboseErrorKind},
        sequence::separated_pair,
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse the text of one stored file.
    pub fn parse_entry(text: &str, kind: EntryKind) -> Result<EntryRecord, MalformedEntry> {
        let lines: Vec<&str> = text.lines().collect();

        let (title, display_date) = lines
            .first()
            .and_then(|line| parse_header(line))
            .ok_or(MalformedEntry::MissingHeader)?;

        let (dream, body_start) = match kind {
            EntryKind::Journal => (None, 1),
            EntryKind::Dream => {
                let meta = lines.get(2..5).ok_or(MalformedEntry::MissingMetadata(
                    lines.len().saturating_sub(2),
                ))?;
                let mut values = Vec::with_capacity(3);
                for (offset, line) in meta.iter().enumerate() {
                    let (_, value) =
                        parse_field(line).ok_or(MalformedEntry::BadField { line: offset + 3 })?;
                    values.push(value);
                }
                let fields = DreamFields::new(values[0], values[1], values[2]);
                (Some(fields), 5)
            }
        };

        let body = clean_body(lines.get(body_start..).unwrap_or_default(), kind);

        Ok(EntryRecord {
            title,
            display_date,
            body,
            dream,
        })
    }

    /// `[ (<title>) | (<date>) ]` -> `(title, date)`.
    ///
    /// Dates never contain `) | (`, so the split is on its last occurrence and titles may
    /// contain it.
    pub fn parse_header(line: &str) -> Option<(String, String)> {
        let (_, inner) = all_consuming(header_line)(line.trim()).ok()?;
        let (title, date) = inner.rsplit_once(HEADER_SPLIT)?;
        Some((title.trim().to_string(), date.trim().to_string()))
    }

    /// `Dream Type: Lucid` -> `("Dream Type", "Lucid")`.
    pub fn parse_field(line: &str) -> Option<(&str, &str)> {
        field_line(line.trim())
            .ok()
            .map(|(_, (name, value))| (name.trim(), value.trim()))
    }

    /// Value of `line` when it is the field `name`.
    pub fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
        line.strip_prefix(name)?.strip_prefix(':').map(str::trim)
    }

    /// Every `-[TAG]-` in `body`. Tags never span lines.
    pub fn extract_tags(body: &str) -> Vec<String> {
        let mut tags = Vec::new();
        let mut rest = body;
        while let Some(open) = rest.find("-[") {
            let after_open = &rest[open + 2..];
            match after_open.find("]-") {
                Some(close) if !after_open[..close].contains('\n') => {
                    tags.push(after_open[..close].to_string());
                    rest = &after_open[close + 2..];
                }
                _ => rest = after_open,
            }
        }
        tags
    }

    /* ------------------------------- Lines ------------------------------- */

    const HEADER_SPLIT: &str = ") | (";

    /// `[ (` ... `) ]` -> the text between the last `) ]` and the opening bracket.
    fn header_line(i: &str) -> PResult<'_, &str> {
        let (i, _) = tag("[ (")(i)?;
        let Some(close) = i.rfind(") ]") else {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("header-close"))],
            }));
        };
        let (inner, tail) = i.split_at(close);
        let (tail, _) = tag(") ]")(tail)?;
        let (tail, _) = space0(tail)?;
        Ok((tail, inner))
    }

    fn field_line(i: &str) -> PResult<'_, (&str, &str)> {
        separated_pair(take_until(":"), char(':'), rest)(i)
    }

    fn clean_body(lines: &[&str], kind: EntryKind) -> String {
        let marker = kind.marker();
        let kept: Vec<String> = lines
            .iter()
            .filter(|line| line.trim() != SEPARATOR)
            .filter_map(|line| {
                if line.contains(marker) {
                    let stripped = line.replace(marker, "");
                    (!stripped.trim().is_empty()).then_some(stripped)
                } else {
                    Some(line.to_string())
                }
            })
            .collect();

        // Edge blank lines go; indentation and inner spacing stay.
        let first = kept.iter().position(|line| !line.trim().is_empty());
        let last = kept.iter().rposition(|line| !line.trim().is_empty());
        match (first, last) {
            (Some(first), Some(last)) => kept[first..=last].join("\n"),
            _ => String::new(),
        }
    }

}

pub mod format {
    use super::core::*;

    /// Canonical text of an entry. Journal entries have a single rule before the body.
    pub fn format_entry(record: &EntryRecord) -> String {
        let header = format!("[ ({}) | ({}) ]", record.title, record.display_date);
        let meta;
        let mut lines: Vec<&str> = vec![header.as_str(), SEPARATOR];

        if let Some(fields) = &record.dream {
            meta = [
                format!("Dream Type: {}", fields.dream_type),
                format!("Technique: {}", fields.technique),
                format!("Sleep Cycle: {}", fields.sleep_cycle),
            ];
            lines.extend(meta.iter().map(String::as_str));
            lines.push(SEPARATOR);
        }

        if !record.body.is_empty() {
            lines.push(&record.body);
        }
        lines.join("\n")
    }

}

pub mod index {
    //! Newest-first index over a store directory.
    //!
    //! Ordering comes from paths, never from filesystem metadata: the `YEAR/Month/DAY`
    //! directories give the date and the timestamp suffix of the file name breaks ties.

    use crate::core::ENTRY_EXTENSION;
    use crate::dates;
    use anyhow::{Context, Result};
    use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::warn;

    /// Length of `YYYYMMDD_HHMMSS_ffffff`.
    pub const STAMP_LEN: usize = 22;

    /* ------------------------------ Stamps ------------------------------ */

    /// Creation stamp appended to every stored file name.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct EntryStamp(String);

    impl EntryStamp {
        pub fn now() -> Self {
            Self::at(Local::now().naive_local())
        }

        pub fn at(instant: NaiveDateTime) -> Self {
            Self(instant.format("%Y%m%d_%H%M%S_%6f").to_string())
        }

        pub fn parse(raw: &str) -> Option<Self> {
            let shaped = raw.len() == STAMP_LEN
                && raw.bytes().enumerate().all(|(idx, b)| match idx {
                    8 | 15 => b == b'_',
                    _ => b.is_ascii_digit(),
                });
            shaped.then(|| Self(raw.to_string()))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }

        /// The stamp's digits read as one integer; later stamps compare greater.
        pub fn tiebreak(&self) -> u128 {
            self.0
                .bytes()
                .filter(u8::is_ascii_digit)
                .fold(0, |acc, b| acc * 10 + u128::from(b - b'0'))
        }
    }

    /* ---------------------------- File names ---------------------------- */

    /// Title -> file name base. This is also the sync dedup key.
    pub fn slug(title: &str) -> String {
        title
            .chars()
            .map(|c| match c {
                ' ' | '/' | '\\' => '_',
                c => c,
            })
            .collect()
    }

    pub fn file_name(title: &str, stamp: &EntryStamp) -> String {
        format!("{}_{}.{}", slug(title), stamp.as_str(), ENTRY_EXTENSION)
    }

    /// `<base>_<stamp>.txt` -> `(base, stamp)`.
    pub fn split_file_name(name: &str) -> Option<(&str, EntryStamp)> {
        let stem = name.strip_suffix(ENTRY_EXTENSION)?.strip_suffix('.')?;
        let split = stem.len().checked_sub(STAMP_LEN + 1)?;
        if !stem.is_char_boundary(split) {
            return None;
        }
        let (base, tail) = stem.split_at(split);
        let stamp = EntryStamp::parse(tail.strip_prefix('_')?)?;
        Some((base, stamp))
    }

    /// File name without its stamp suffix. Names without a stamp keep their stem.
    pub fn base_name(name: &str) -> &str {
        match split_file_name(name) {
            Some((base, _)) => base,
            None => name
                .strip_suffix(ENTRY_EXTENSION)
                .and_then(|s| s.strip_suffix('.'))
                .unwrap_or(name),
        }
    }

    /* ------------------------------ Ordering ------------------------------ */

    /// Date encoded by the three directories enclosing `path`.
    pub fn path_date(path: &Path) -> Option<NaiveDate> {
        let mut dirs = path.parent()?.iter().rev();
        let day = dirs.next()?.to_str()?.parse::<u32>().ok()?;
        let month = dates::month_number(dirs.next()?.to_str()?)?;
        let year = dirs.next()?.to_str()?.parse::<i32>().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    pub fn tiebreak(path: &Path) -> u128 {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(split_file_name)
            .map(|(_, stamp)| stamp.tiebreak())
            .unwrap_or(0)
    }

    /// Directory holding the entries dated `date`.
    pub fn entry_dir(root: &Path, date: NaiveDate) -> PathBuf {
        root.join(date.year().to_string())
            .join(dates::month_name(date.month()).unwrap_or_default())
            .join(date.day().to_string())
    }

    /// Every entry file under `root`, newest first.
    ///
    /// Unparseable directory dates sort last; unparseable stamps lose ties.
    pub fn list_entries(root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        visit_dir(root, &mut files).with_context(|| format!("indexing {:?}", root))?;

        let mut keyed: Vec<(NaiveDate, u128, PathBuf)> = files
            .into_iter()
            .map(|path| {
                let date = path_date(&path).unwrap_or(NaiveDate::MIN);
                (date, tiebreak(&path), path)
            })
            .collect();
        keyed.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        Ok(keyed.into_iter().map(|(_, _, path)| path).collect())
    }

    /// Only `dir` itself must be readable; unreadable children are logged and skipped.
    fn visit_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let mut children = Vec::new();
        let listing = fs::read_dir(dir).with_context(|| format!("reading directory {:?}", dir))?;
        for entry in listing {
            match entry {
                Ok(entry) => children.push(entry),
                Err(err) => warn!(dir = %dir.display(), error = %err, "skipping unreadable entry"),
            }
        }
        children.sort_by_key(|entry| entry.file_name());

        for entry in children {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                if let Err(err) = visit_dir(&path, out) {
                    let reason = format!("{err:#}");
                    warn!(path = %path.display(), %reason, "skipping unreadable directory");
                }
            } else if file_type.is_file()
                && path
                    .extension()
                    .map(|ext| ext == ENTRY_EXTENSION)
                    .unwrap_or(false)
            {
                out.push(path);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn touch(root: &Path, rel: &str) -> PathBuf {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            fs::write(&path, "x").expect("write");
            path
        }

        #[test]
        fn newest_date_comes_first() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let first = touch(tmp.path(), "2024/January/1/A_20240101_080000_000000.txt");
            let third = touch(tmp.path(), "2024/January/3/C_20240103_080000_000000.txt");
            let second = touch(tmp.path(), "2024/January/2/B_20240102_080000_000000.txt");

            let listed = list_entries(tmp.path()).expect("index");
            assert_eq!(listed, vec![third, second, first]);
        }

        #[test]
        fn stamp_breaks_ties_within_a_day() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let early = touch(tmp.path(), "2023/June/9/Zed_20230609_070000_000001.txt");
            let late = touch(tmp.path(), "2023/June/9/Alpha_20230609_230000_000000.txt");
            let unstamped = touch(tmp.path(), "2023/June/9/notes.txt");

            let listed = list_entries(tmp.path()).expect("index");
            assert_eq!(listed, vec![late, early, unstamped]);
        }

        #[test]
        fn bad_paths_sort_last_and_other_files_are_ignored() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let stray = touch(tmp.path(), "misc/Stray_20990101_000000_000000.txt");
            let good = touch(tmp.path(), "1999/December/31/Party_19991231_235959_999999.txt");
            touch(tmp.path(), "2024/March/5/image.png");

            let listed = list_entries(tmp.path()).expect("index");
            assert_eq!(listed, vec![good, stray]);
        }

        #[test]
        fn missing_root_is_an_error() {
            let tmp = tempfile::tempdir().expect("tempdir");
            assert!(list_entries(&tmp.path().join("absent")).is_err());
        }

        #[cfg(unix)]
        #[test]
        fn unreadable_subdirectory_does_not_fail_the_scan() {
            use std::os::unix::fs::PermissionsExt;

            let tmp = tempfile::tempdir().expect("tempdir");
            let kept = touch(tmp.path(), "2024/March/5/A_20240305_080000_000000.txt");
            touch(tmp.path(), "2023/May/1/B_20230501_080000_000000.txt");
            let locked = tmp.path().join("2023");
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).expect("chmod");

            let listed = list_entries(tmp.path());
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).expect("restore");

            // Root ignores permission bits and still sees the locked entry.
            let listed = listed.expect("scan completes");
            assert_eq!(listed.first(), Some(&kept));
            assert!(listed.len() <= 2);
        }

        #[test]
        fn path_date_reads_directories() {
            let date = path_date(Path::new("/store/2024/March/5/x.txt"));
            assert_eq!(date, NaiveDate::from_ymd_opt(2024, 3, 5));
            assert_eq!(path_date(Path::new("/store/2024/Marchy/5/x.txt")), None);
            assert_eq!(path_date(Path::new("/store/2024/February/30/x.txt")), None);
            assert_eq!(path_date(Path::new("x.txt")), None);
        }

        #[test]
        fn file_names_split_into_base_and_stamp() {
            let stamp = EntryStamp::at(
                NaiveDate::from_ymd_opt(2024, 3, 5)
                    .unwrap()
                    .and_hms_micro_opt(7, 8, 9, 42)
                    .unwrap(),
            );
            assert_eq!(stamp.as_str(), "20240305_070809_000042");

            let name = file_name("Flying Dream", &stamp);
            assert_eq!(name, "Flying_Dream_20240305_070809_000042.txt");
            let (base, parsed) = split_file_name(&name).expect("split");
            assert_eq!(base, "Flying_Dream");
            assert_eq!(parsed, stamp);

            assert_eq!(base_name("Flying_Dream.txt"), "Flying_Dream");
            assert_eq!(base_name("Short_2024.txt"), "Short_2024");
            assert!(split_file_name("Café_20240305_070809_00004.txt").is_none());
        }

        #[test]
        fn slug_keeps_names_inside_the_day_directory() {
            assert_eq!(slug("Up and/away"), "Up_and_away");
        }

        #[test]
        fn later_stamps_have_larger_tiebreaks() {
            let a = EntryStamp::parse("20240305_070809_000042").unwrap();
            let b = EntryStamp::parse("20240305_070809_000043").unwrap();
            assert!(b.tiebreak() > a.tiebreak());
            assert!(EntryStamp::parse("20240305-070809-000043").is_none());
        }
    }
}

pub mod store {
    //! A single store root (dream or journal) and its file operations.

    use crate::core::*;
    use crate::dates;
    use crate::index::{self, EntryStamp};
    use anyhow::{Context, Result, bail};
    use chrono::NaiveDate;
    use serde::Serialize;
    use std::{
        fs::{self, File},
        io::Write,
        path::{Path, PathBuf},
    };
    use tracing::{info, warn};

    /// What a new blank entry needs.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct EntryDraft {
        pub title: String,
        pub date: NaiveDate,
        pub dream: Option<DreamFields>,
    }

    impl EntryDraft {
        pub fn new(kind: EntryKind, date: NaiveDate) -> Self {
            let dream = match kind {
                EntryKind::Dream => Some(DreamFields::from_values(
                    &[DreamType::Lucid],
                    Technique::Wild,
                    SleepCycle::Regular,
                )),
                EntryKind::Journal => None,
            };
            Self {
                title: kind.untitled().to_string(),
                date,
                dream,
            }
        }

        pub fn with_title(mut self, title: impl Into<String>) -> Self {
            self.title = title.into();
            self
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct LoadedEntry {
        pub path: PathBuf,
        pub record: EntryRecord,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct LoadFailure {
        pub path: PathBuf,
        pub reason: String,
    }

    /// Result of parsing many files: dirty files are listed, never fatal.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct LoadReport {
        pub entries: Vec<LoadedEntry>,
        pub failures: Vec<LoadFailure>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SearchHit {
        /// 1-based position in the newest-first index.
        pub position: usize,
        pub path: PathBuf,
    }

    pub fn read_entry(path: &Path, kind: EntryKind) -> Result<EntryRecord> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        EntryRecord::parse(&text, kind).with_context(|| format!("parsing {:?}", path))
    }

    /// Parse every path, keeping going past malformed files.
    pub fn load_entries(paths: &[PathBuf], kind: EntryKind) -> LoadReport {
        let mut report = LoadReport::default();
        for path in paths {
            match read_entry(path, kind) {
                Ok(record) => report.entries.push(LoadedEntry {
                    path: path.clone(),
                    record,
                }),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(path = %path.display(), %reason, "skipping malformed entry");
                    report.failures.push(LoadFailure {
                        path: path.clone(),
                        reason,
                    });
                }
            }
        }
        report
    }

    /// Body of a freshly created entry, ready for the editor.
    pub fn blank_body(kind: EntryKind) -> String {
        format!("{}\n{}\n[]", kind.marker(), SEPARATOR)
    }

    /// Create `path` and write `text`; never replaces an existing file.
    pub(crate) fn write_new(path: &Path, text: &str) -> Result<()> {
        let mut file = File::create_new(path).with_context(|| format!("creating {:?}", path))?;
        file.write_all(text.as_bytes())
            .with_context(|| format!("writing {:?}", path))?;
        Ok(())
    }

    #[derive(Debug, Clone)]
    pub struct EntryStore {
        root: PathBuf,
        kind: EntryKind,
    }

    impl EntryStore {
        pub fn new(root: impl Into<PathBuf>, kind: EntryKind) -> Self {
            Self {
                root: root.into(),
                kind,
            }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn kind(&self) -> EntryKind {
            self.kind
        }

        pub fn entry_dir(&self, date: NaiveDate) -> PathBuf {
            index::entry_dir(&self.root, date)
        }

        /// Entry paths, newest first.
        pub fn list(&self) -> Result<Vec<PathBuf>> {
            index::list_entries(&self.root)
        }

        pub fn read(&self, path: &Path) -> Result<EntryRecord> {
            read_entry(path, self.kind)
        }

        pub fn load_all(&self) -> Result<LoadReport> {
            Ok(load_entries(&self.list()?, self.kind))
        }

        /// Write a blank entry for `draft` and return its path.
        pub fn create(&self, draft: &EntryDraft, stamp: &EntryStamp) -> Result<PathBuf> {
            let dream = match self.kind {
                EntryKind::Dream => draft
                    .dream
                    .clone()
                    .or_else(|| EntryDraft::new(self.kind, draft.date).dream),
                EntryKind::Journal => None,
            };
            let record = EntryRecord {
                title: draft.title.clone(),
                display_date: dates::display_date(draft.date),
                body: blank_body(self.kind),
                dream,
            };

            let dir = self.entry_dir(draft.date);
            fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
            let path = dir.join(index::file_name(&draft.title, stamp));
            write_new(&path, &record.format())?;

            info!(kind = %self.kind, path = %path.display(), "created entry");
            Ok(path)
        }

        pub fn delete(&self, path: &Path) -> Result<()> {
            if !path.starts_with(&self.root) {
                bail!("{:?} is not inside the {} store", path, self.kind);
            }
            fs::remove_file(path).with_context(|| format!("deleting {:?}", path))?;
            info!(kind = %self.kind, path = %path.display(), "deleted entry");
            Ok(())
        }

        /// Case-insensitive substring search over whole files, in index order.
        pub fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
            let needle = query.to_lowercase();
            let mut hits = Vec::new();
            for (idx, path) in self.list()?.into_iter().enumerate() {
                match fs::read_to_string(&path) {
                    Ok(text) if text.to_lowercase().contains(&needle) => hits.push(SearchHit {
                        position: idx + 1,
                        path,
                    }),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            error = %err,
                            "skipping unreadable entry in search"
                        )
                    }
                }
            }
            Ok(hits)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn stamp(micros: u32) -> EntryStamp {
            EntryStamp::at(
                NaiveDate::from_ymd_opt(2024, 3, 5)
                    .unwrap()
                    .and_hms_micro_opt(9, 0, 0, micros)
                    .unwrap(),
            )
        }

        #[test]
        fn create_writes_a_blank_dream_into_the_day_directory() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = EntryStore::new(tmp.path(), EntryKind::Dream);
            let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
            let draft = EntryDraft::new(EntryKind::Dream, date).with_title("Night Swim");

            let path = store.create(&draft, &stamp(1)).expect("create");
            assert_eq!(
                path,
                tmp.path()
                    .join("2024/March/5/Night_Swim_20240305_090000_000001.txt")
            );

            let record = store.read(&path).expect("read back");
            assert_eq!(record.title, "Night Swim");
            assert_eq!(record.display_date, "5 March, 2024");
            assert_eq!(record.body, "[]");
            let fields = record.dream.expect("dream fields");
            assert_eq!(fields, DreamFields::new("Lucid", "WILD", "Regular"));
        }

        #[test]
        fn create_never_overwrites() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = EntryStore::new(tmp.path(), EntryKind::Journal);
            let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
            let draft = EntryDraft::new(EntryKind::Journal, date);

            store.create(&draft, &stamp(7)).expect("first create");
            assert!(store.create(&draft, &stamp(7)).is_err());
            store.create(&draft, &stamp(8)).expect("new stamp");
            assert_eq!(store.list().expect("list").len(), 2);
        }

        #[test]
        fn malformed_files_are_skipped_and_reported() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = EntryStore::new(tmp.path(), EntryKind::Journal);
            let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
            store
                .create(&EntryDraft::new(EntryKind::Journal, date), &stamp(1))
                .expect("create");
            let dir = store.entry_dir(date);
            fs::write(dir.join("Broken_20240102_090000_000002.txt"), "no header\nbody")
                .expect("write");

            let paths = store.list().expect("list");
            assert_eq!(paths.len(), 2);
            let report = load_entries(&paths, EntryKind::Journal);
            assert_eq!(report.entries.len(), 1);
            assert_eq!(report.failures.len(), 1);
            assert!(report.failures[0].path.ends_with("Broken_20240102_090000_000002.txt"));
        }

        #[test]
        fn delete_stays_inside_the_store() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = EntryStore::new(tmp.path().join("dreams"), EntryKind::Dream);
            let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
            let path = store
                .create(&EntryDraft::new(EntryKind::Dream, date), &stamp(1))
                .expect("create");

            let outside = tmp.path().join("keep.txt");
            fs::write(&outside, "keep").expect("write");
            assert!(store.delete(&outside).is_err());
            assert!(outside.exists());

            store.delete(&path).expect("delete");
            assert!(!path.exists());
            assert!(store.delete(&path).is_err());
        }

        #[test]
        fn search_is_case_insensitive_and_keeps_positions() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = EntryStore::new(tmp.path(), EntryKind::Journal);
            let older = store
                .create(
                    &EntryDraft::new(
                        EntryKind::Journal,
                        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                    )
                        .with_title("Ocean Walk"),
                    &stamp(1),
                )
                .expect("create");
            store
                .create(
                    &EntryDraft::new(
                        EntryKind::Journal,
                        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                    )
                        .with_title("Mountain"),
                    &stamp(2),
                )
                .expect("create");

            let hits = store.search("OCEAN").expect("search");
            assert_eq!(
                hits,
                vec![SearchHit {
                    position: 2,
                    path: older
                }]
            );
            assert!(store.search("desert").expect("search").is_empty());
        }
    }
}

pub mod import {
    //! Splits a flat export (blocks between `=` delimiter lines) into [`ImportBlock`]s.

    use crate::core::*;
    use crate::parser;

    const DREAM_TYPE: &str = "Dream Type";
    const TECHNIQUE: &str = "Technique";
    const SLEEP_CYCLE: &str = "Sleep Cycle";

    /// One entry as found in an export, before it becomes an [`EntryRecord`].
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ImportBlock {
        pub title: String,
        pub date: String,
        pub body: String,
        /// `Some` for dream exports; missing field lines stay empty.
        pub dream: Option<DreamFields>,
    }

    impl ImportBlock {
        fn empty(kind: EntryKind) -> Self {
            Self {
                dream: (kind == EntryKind::Dream).then(DreamFields::default),
                ..Self::default()
            }
        }

        pub fn kind(&self) -> EntryKind {
            if self.dream.is_some() {
                EntryKind::Dream
            } else {
                EntryKind::Journal
            }
        }
    }

    /// Blocks in input order. Text before the first delimiter and blocks without a body
    /// are dropped.
    pub fn parse_blocks(input: &str, kind: EntryKind) -> Vec<ImportBlock> {
        let mut blocks = Vec::new();
        let mut current: Option<BlockBuilder> = None;

        for raw in input.lines() {
            let line = raw.trim();
            if line == DELIMITER {
                if let Some(done) = current.take() {
                    done.finish(&mut blocks);
                }
                current = Some(BlockBuilder::new(kind));
            } else if let Some(builder) = current.as_mut() {
                builder.feed(line);
            }
        }
        if let Some(done) = current {
            done.finish(&mut blocks);
        }

        blocks
    }

    struct BlockBuilder {
        block: ImportBlock,
        capturing: bool,
    }

    impl BlockBuilder {
        fn new(kind: EntryKind) -> Self {
            Self {
                block: ImportBlock::empty(kind),
                capturing: false,
            }
        }

        fn feed(&mut self, line: &str) {
            if let Some((title, date)) = parser::parse_header(line) {
                self.block.title = title;
                self.block.date = date;
                return;
            }

            if let Some(fields) = self.block.dream.as_mut() {
                let slots = [
                    (DREAM_TYPE, &mut fields.dream_type),
                    (TECHNIQUE, &mut fields.technique),
                    (SLEEP_CYCLE, &mut fields.sleep_cycle),
                ];
                for (name, slot) in slots {
                    if let Some(value) = parser::field_value(line, name) {
                        *slot = value.to_string();
                        return;
                    }
                }
            }

            if line.starts_with(SEPARATOR) {
                return;
            }

            let body = &mut self.block.body;
            if self.capturing {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
            } else if !line.is_empty() {
                self.capturing = true;
                *body = line.to_string();
            }
        }

        fn finish(mut self, out: &mut Vec<ImportBlock>) {
            let kept = self.block.body.trim_end().len();
            self.block.body.truncate(kept);
            if !self.block.body.is_empty() {
                out.push(self.block);
            }
        }
    }

}

pub mod sync {
    //! Idempotent import of an export file into a store.
    //!
    //! A block is written only when no file in its day directory already carries its
    //! dedup key (the title slug). Existing files are never touched, so re-running a sync,
    //! even after an interrupted one, only fills the gaps.

    use crate::core::*;
    use crate::dates::{self, DateOrder};
    use crate::import::{self, ImportBlock};
    use crate::index::{self, EntryStamp};
    use crate::store::{self, EntryStore};
    use anyhow::{Context, Result};
    use serde::Serialize;
    use std::{
        collections::BTreeSet,
        fs,
        path::{Path, PathBuf},
        thread,
        time::Duration,
    };
    use tracing::{debug, info, warn};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SyncFailure {
        pub title: String,
        pub date: String,
        pub reason: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct SyncReport {
        /// Blocks found in the input.
        pub parsed: usize,
        pub created: Vec<PathBuf>,
        /// Blocks whose dedup key already existed.
        pub skipped: usize,
        pub failures: Vec<SyncFailure>,
    }

    enum Merge {
        Created(PathBuf),
        AlreadyPresent,
    }

    pub struct SyncEngine<'a> {
        store: &'a EntryStore,
        delay: Duration,
    }

    impl<'a> SyncEngine<'a> {
        pub fn new(store: &'a EntryStore) -> Self {
            Self {
                store,
                delay: Duration::ZERO,
            }
        }

        /// Pause before each block (progress pacing for interactive runs).
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn run_file(&self, path: &Path) -> Result<SyncReport> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading sync file {:?}", path))?;
            Ok(self.run(&text))
        }

        pub fn run(&self, input: &str) -> SyncReport {
            let mut blocks = import::parse_blocks(input, self.store.kind());
            // Exports list newest first; merge oldest first so it keeps a contested slot.
            blocks.reverse();

            let mut report = SyncReport {
                parsed: blocks.len(),
                ..SyncReport::default()
            };

            for block in &blocks {
                if !self.delay.is_zero() {
                    thread::sleep(self.delay);
                }
                match self.merge(block) {
                    Ok(Merge::Created(path)) => {
                        debug!(path = %path.display(), "synced entry");
                        report.created.push(path);
                    }
                    Ok(Merge::AlreadyPresent) => {
                        debug!(title = %block.title, date = %block.date, "entry already present");
                        report.skipped += 1;
                    }
                    Err(err) => {
                        let reason = format!("{err:#}");
                        warn!(
                            title = %block.title,
                            date = %block.date,
                            %reason,
                            "failed to sync block"
                        );
                        report.failures.push(SyncFailure {
                            title: block.title.clone(),
                            date: block.date.clone(),
                            reason,
                        });
                    }
                }
            }

            info!(
                kind = %self.store.kind(),
                parsed = report.parsed,
                created = report.created.len(),
                skipped = report.skipped,
                failed = report.failures.len(),
                "sync finished"
            );
            report
        }

        fn merge(&self, block: &ImportBlock) -> Result<Merge> {
            let kind = self.store.kind();
            let body = repair_marker(&block.body, kind);

            let date = dates::to_sortable(&block.date, DateOrder::DayFirst, false)
                .and_then(|parts| parts.to_naive())
                .with_context(|| format!("date of {:?}", block.title))?;

            let dir = self.store.entry_dir(date);
            fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;

            let key = index::slug(&block.title);
            if existing_base_names(&dir)?.contains(&key) {
                return Ok(Merge::AlreadyPresent);
            }

            let record = EntryRecord {
                title: block.title.clone(),
                display_date: dates::display_date(date),
                body,
                dream: block.dream.clone(),
            };
            let path = dir.join(index::file_name(&block.title, &EntryStamp::now()));
            store::write_new(&path, &record.format())?;
            Ok(Merge::Created(path))
        }
    }

    fn existing_base_names(dir: &Path) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(dir).with_context(|| format!("listing {:?}", dir))? {
            let name = entry?.file_name();
            if let Some(name) = name.to_str() {
                names.insert(index::base_name(name).to_string());
            }
        }
        Ok(names)
    }

    /// Exports drop the rule under the marker line; put it back.
    fn repair_marker(body: &str, kind: EntryKind) -> String {
        let marker = kind.marker();
        let lines: Vec<&str> = body.lines().collect();
        let mut out = Vec::with_capacity(lines.len() + 1);
        for (idx, line) in lines.iter().enumerate() {
            out.push(*line);
            let ruled = lines
                .get(idx + 1)
                .is_some_and(|next| next.trim() == SEPARATOR);
            if line.trim() == marker && !ruled {
                out.push(SEPARATOR);
            }
        }
        out.join("\n")
    }

}

pub mod stats {
    //! Counts, streaks and per-day series over a loaded store.

    use crate::core::*;
    use crate::store::{LoadReport, LoadedEntry};
    use chrono::{Datelike, NaiveDate};
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Statistics {
        pub total: usize,
        /// Malformed files plus entries whose date does not parse.
        pub dirty: usize,
        pub dream_types: IndexMap<String, usize>,
        pub techniques: IndexMap<String, usize>,
        pub sleep_cycles: IndexMap<String, usize>,
        /// Most consecutive calendar days with at least one entry.
        pub longest_streak: usize,
    }

    pub fn compute(report: &LoadReport) -> Statistics {
        let mut stats = Statistics {
            total: report.entries.len() + report.failures.len(),
            dirty: report.failures.len(),
            ..Statistics::default()
        };

        let mut days = BTreeSet::new();
        for entry in &report.entries {
            match entry.record.date() {
                Ok(date) => {
                    days.insert(date);
                }
                Err(_) => stats.dirty += 1,
            }
            if let Some(fields) = &entry.record.dream {
                tally(&mut stats.dream_types, &fields.dream_type);
                tally(&mut stats.techniques, &fields.technique);
                tally(&mut stats.sleep_cycles, &fields.sleep_cycle);
            }
        }

        for counts in [
            &mut stats.dream_types,
            &mut stats.techniques,
            &mut stats.sleep_cycles,
        ] {
            // Stable: equal counts keep first-seen order.
            counts.sort_by(|_, a, _, b| b.cmp(a));
        }
        stats.longest_streak = longest_streak(days);
        stats
    }

    fn tally(counts: &mut IndexMap<String, usize>, value: &str) {
        for part in split_values(value) {
            *counts.entry(part.to_string()).or_insert(0) += 1;
        }
    }

    /// Repeated dates count once.
    pub fn longest_streak(dates: impl IntoIterator<Item = NaiveDate>) -> usize {
        let days: BTreeSet<NaiveDate> = dates.into_iter().collect();
        let mut best = 0;
        let mut run = 0;
        let mut prev: Option<NaiveDate> = None;
        for day in days {
            run = match prev.and_then(|p| p.succ_opt()) {
                Some(next) if next == day => run + 1,
                _ => 1,
            };
            best = best.max(run);
            prev = Some(day);
        }
        best
    }

    /// Entries per day within `from..=to`; days without entries are absent.
    pub fn daily_counts(
        entries: &[LoadedEntry],
        from: NaiveDate,
        to: NaiveDate,
        only: Option<DreamType>,
    ) -> BTreeMap<NaiveDate, usize> {
        let mut counts = BTreeMap::new();
        for entry in entries {
            let Ok(date) = entry.record.date() else {
                continue;
            };
            if date < from || date > to {
                continue;
            }
            if let Some(wanted) = only {
                let matches = entry
                    .record
                    .dream
                    .as_ref()
                    .is_some_and(|f| f.dream_types().contains(&wanted));
                if !matches {
                    continue;
                }
            }
            *counts.entry(date).or_insert(0) += 1;
        }
        counts
    }

    /// `YYYY-MM` -> first day of that month.
    pub fn parse_month(raw: &str) -> Option<NaiveDate> {
        let (year, month) = raw.trim().split_once('-')?;
        NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
    }

    /// Last day of the month containing `date`.
    pub fn month_end(date: NaiveDate) -> NaiveDate {
        let (year, month) = match date.month() {
            12 => (date.year() + 1, 1),
            m => (date.year(), m + 1),
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|first| first.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::store::LoadFailure;
        use std::path::PathBuf;

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn dream(date: &str, types: &str, technique: &str) -> LoadedEntry {
            LoadedEntry {
                path: PathBuf::from(format!("{date}.txt")),
                record: EntryRecord::dream(
                    "t",
                    date,
                    "b",
                    DreamFields::new(types, technique, "Regular"),
                ),
            }
        }

        #[test]
        fn streak_ignores_duplicates_and_gaps() {
            let dates = [
                day(2024, 1, 1),
                day(2024, 1, 2),
                day(2024, 1, 2),
                day(2024, 1, 3),
                day(2024, 1, 5),
                day(2024, 1, 6),
            ];
            assert_eq!(longest_streak(dates), 3);
            assert_eq!(longest_streak(Vec::<NaiveDate>::new()), 0);
            assert_eq!(longest_streak([day(2023, 12, 31), day(2024, 1, 1)]), 2);
        }

        #[test]
        fn counts_split_multi_valued_types() {
            let report = LoadReport {
                entries: vec![
                    dream("1 March, 2024", "Vivid, Lucid", "WILD"),
                    dream("2 March, 2024", "Lucid", "MILD"),
                    dream("3 March, 2024", "Nightmare", "MILD"),
                    dream("Thirty Smarch, 2024", "Lucid", "WILD"),
                ],
                failures: vec![LoadFailure {
                    path: PathBuf::from("bad.txt"),
                    reason: "missing header".into(),
                }],
            };

            let stats = compute(&report);
            assert_eq!(stats.total, 5);
            assert_eq!(stats.dirty, 2);
            assert_eq!(stats.longest_streak, 3);

            let types: Vec<_> = stats.dream_types.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            assert_eq!(types, vec![("Lucid", 3), ("Vivid", 1), ("Nightmare", 1)]);
            assert_eq!(stats.techniques.get("WILD"), Some(&2));
            assert_eq!(stats.sleep_cycles.get("Regular"), Some(&4));
        }

        #[test]
        fn daily_counts_filter_by_range_and_type() {
            let entries = vec![
                dream("1 March, 2024", "Lucid", "WILD"),
                dream("1 March, 2024", "Vivid", "WILD"),
                dream("9 April, 2024", "Lucid", "WILD"),
                dream("1 May, 2024", "Lucid", "WILD"),
            ];
            let from = parse_month("2024-03").expect("from");
            let to = month_end(parse_month("2024-04").expect("to"));
            assert_eq!(to, day(2024, 4, 30));

            let all = daily_counts(&entries, from, to, None);
            assert_eq!(all.get(&day(2024, 3, 1)), Some(&2));
            assert_eq!(all.len(), 2);

            let lucid = daily_counts(&entries, from, to, Some(DreamType::Lucid));
            assert_eq!(lucid.get(&day(2024, 3, 1)), Some(&1));
            assert_eq!(lucid.get(&day(2024, 4, 9)), Some(&1));
        }

        #[test]
        fn counts_and_graph_filter_agree_on_values() {
            let entries = vec![
                dream("1 March, 2024", "Lucid,Vivid", "WILD"),
                dream("2 March, 2024", "Lucid Vivid", "WILD"),
            ];
            let stats = compute(&LoadReport {
                entries: entries.clone(),
                failures: Vec::new(),
            });
            let keys: Vec<_> = stats.dream_types.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["Lucid", "Vivid", "Lucid Vivid"]);

            let from = day(2024, 3, 1);
            let to = day(2024, 3, 31);
            let vivid = daily_counts(&entries, from, to, Some(DreamType::Vivid));
            assert_eq!(vivid.into_iter().collect::<Vec<_>>(), vec![(from, 1)]);
        }

        #[test]
        fn month_helpers() {
            assert_eq!(parse_month("2024-13"), None);
            assert_eq!(parse_month("March"), None);
            assert_eq!(month_end(day(2023, 12, 4)), day(2023, 12, 31));
            assert_eq!(month_end(day(2024, 2, 1)), day(2024, 2, 29));
        }
    }
}

pub mod backup {
    //! Consolidates a store into one flat file that `sync` can read back.

    use crate::core::*;
    use crate::parser;
    use crate::store::{EntryStore, LoadFailure};
    use anyhow::{Context, Result};
    use chrono::NaiveDateTime;
    use serde::Serialize;
    use std::{
        fs,
        path::{Path, PathBuf},
    };
    use tracing::{info, warn};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct BackupReport {
        pub path: PathBuf,
        pub written: usize,
        pub failures: Vec<LoadFailure>,
    }

    pub fn backup_file_name(kind: EntryKind, at: NaiveDateTime) -> String {
        format!("[{}]_{}_Backup.txt", at.format("%Y-%m-%d-%H-%M-%S"), kind.label())
    }

    /// Entry text from its header line onward.
    fn from_header(text: &str) -> Option<String> {
        let lines: Vec<&str> = text.lines().collect();
        let start = lines
            .iter()
            .position(|line| parser::parse_header(line).is_some())?;
        Some(lines[start..].join("\n").trim_end().to_string())
    }

    pub fn write_backup(
        store: &EntryStore,
        backup_dir: &Path,
        at: NaiveDateTime,
    ) -> Result<BackupReport> {
        let mut out = format!("{DELIMITER}\n");
        let mut written = 0;
        let mut failures = Vec::new();

        for path in store.list()? {
            let entry = fs::read_to_string(&path)
                .with_context(|| format!("reading {:?}", path))
                .and_then(|text| {
                    from_header(&text).with_context(|| format!("{:?} has no header line", path))
                });
            match entry {
                Ok(text) => {
                    out.push_str(&text);
                    out.push_str("\n\n");
                    out.push_str(DELIMITER);
                    out.push('\n');
                    written += 1;
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(path = %path.display(), %reason, "leaving entry out of backup");
                    failures.push(LoadFailure { path, reason });
                }
            }
        }

        fs::create_dir_all(backup_dir).with_context(|| format!("creating {:?}", backup_dir))?;
        let path = backup_dir.join(backup_file_name(store.kind(), at));
        fs::write(&path, out).with_context(|| format!("writing backup {:?}", path))?;
        info!(kind = %store.kind(), path = %path.display(), written, "backup written");

        Ok(BackupReport {
            path,
            written,
            failures,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::store::EntryDraft;
        use crate::sync::SyncEngine;
        use chrono::NaiveDate;

        fn at() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .unwrap()
                .and_hms_opt(21, 4, 9)
                .unwrap()
        }

        #[test]
        fn file_name_carries_time_and_kind() {
            assert_eq!(
                backup_file_name(EntryKind::Dream, at()),
                "[2024-03-05-21-04-09]_Dream_Backup.txt"
            );
        }

        #[test]
        fn backup_resyncs_into_an_empty_store() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let source = EntryStore::new(tmp.path().join("dreams"), EntryKind::Dream);
            let input = format!(
                "{DELIMITER}\n[ (Flying Dream) | (5 March, 2024) ]\nDream Type: Lucid, Vivid\nTechnique: WILD\nSleep Cycle: WBTB\n{SEPARATOR}\nAbove the roofs.\n\nThen falling.\n{DELIMITER}\n[ (Teeth) | (1 January, 2023) ]\nDream Type: Nightmare\nTechnique: N/A\nSleep Cycle: Regular\n{SEPARATOR}\nAgain.\n"
            );
            assert_eq!(SyncEngine::new(&source).run(&input).created.len(), 2);
            source
                .create(
                    &EntryDraft::new(
                        EntryKind::Dream,
                        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                    ),
                    &crate::index::EntryStamp::at(at()),
                )
                .expect("blank entry");
            fs::write(source.root().join("2024/March/5/junk_20240305_000000_000000.txt"), "\n\n")
                .expect("junk");

            let report = write_backup(&source, &tmp.path().join("backups"), at()).expect("backup");
            assert_eq!(report.written, 3);
            assert_eq!(report.failures.len(), 1);
            let text = fs::read_to_string(&report.path).expect("read backup");
            let first = format!("{DELIMITER}\n[ (Untitled Dream) | (1 June, 2024) ]");
            assert!(text.starts_with(&first));

            let restored = EntryStore::new(tmp.path().join("restored"), EntryKind::Dream);
            let resync = SyncEngine::new(&restored).run_file(&report.path).expect("resync");
            assert_eq!(resync.created.len(), 3);
            assert!(resync.failures.is_empty());

            let before = source.load_all().expect("load source");
            let copied = restored.load_all().expect("load restored");
            let records = |r: &crate::store::LoadReport| {
                r.entries.iter().map(|e| e.record.clone()).collect::<Vec<_>>()
            };
            assert_eq!(records(&copied), records(&before));
        }
    }
}

pub mod config {
    //! The JSON settings file.

    use crate::core::EntryKind;
    use anyhow::{Context, Result};
    use serde::Deserialize;
    use serde_with::{DurationMilliSeconds, serde_as};
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };

    pub const DEFAULT_LOG_FILE: &str = "logs.txt";

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ConfigError {
        #[error("configured directory {0:?} does not exist")]
        MissingDirectory(PathBuf),
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Settings {
        pub directories: Directories,
        pub paths: Paths,
        #[serde(default)]
        pub editor: Option<String>,
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        #[serde(default, rename = "sync-delay-ms")]
        pub sync_delay: Duration,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    pub struct Directories {
        pub dreams: PathBuf,
        pub journals: PathBuf,
        pub backups: PathBuf,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Paths {
        pub dream_sync: PathBuf,
        pub journal_sync: PathBuf,
        #[serde(default)]
        pub logs: Option<PathBuf>,
    }

    impl Settings {
        /// Read `path`; relative entries resolve against its directory.
        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading settings {:?}", path))?;
            let settings: Settings = serde_json::from_str(&text)
                .with_context(|| format!("parsing settings {:?}", path))?;
            let base = path.parent().unwrap_or(Path::new(""));
            Ok(settings.resolved_against(base))
        }

        fn resolved_against(mut self, base: &Path) -> Self {
            let fix = |p: &mut PathBuf| {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            };
            fix(&mut self.directories.dreams);
            fix(&mut self.directories.journals);
            fix(&mut self.directories.backups);
            fix(&mut self.paths.dream_sync);
            fix(&mut self.paths.journal_sync);
            let mut logs = self
                .paths
                .logs
                .take()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
            fix(&mut logs);
            self.paths.logs = Some(logs);
            self
        }

        pub fn store_root(&self, kind: EntryKind) -> &Path {
            match kind {
                EntryKind::Dream => &self.directories.dreams,
                EntryKind::Journal => &self.directories.journals,
            }
        }

        pub fn sync_file(&self, kind: EntryKind) -> &Path {
            match kind {
                EntryKind::Dream => &self.paths.dream_sync,
                EntryKind::Journal => &self.paths.journal_sync,
            }
        }

        pub fn backup_dir(&self) -> &Path {
            &self.directories.backups
        }

        pub fn log_file(&self) -> PathBuf {
            self.paths
                .logs
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
        }

        /// Program and leading arguments: `editor`, else `$EDITOR`, else `vi`.
        pub fn editor_command(&self) -> (String, Vec<String>) {
            let raw = self
                .editor
                .clone()
                .filter(|e| !e.trim().is_empty())
                .or_else(|| std::env::var("EDITOR").ok().filter(|e| !e.trim().is_empty()))
                .unwrap_or_else(|| "vi".to_string());
            let mut words = raw.split_whitespace().map(str::to_string);
            let program = words.next().unwrap_or_else(|| "vi".to_string());
            (program, words.collect())
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            for dir in [
                &self.directories.dreams,
                &self.directories.journals,
                &self.directories.backups,
            ] {
                if !dir.is_dir() {
                    return Err(ConfigError::MissingDirectory(dir.clone()));
                }
            }
            Ok(())
        }
    }

}

pub mod logging {
    //! Subscriber setup and the persistent log file.

    use anyhow::{Context, Result};
    use std::{
        fs::{self, File},
        io::{self, ErrorKind},
        path::Path,
    };
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    /// Append events to `log_file`; with `verbose`, mirror them to stderr at debug level.
    /// Keep the guard alive until exit or buffered lines are lost.
    pub fn init(log_file: &Path, verbose: bool) -> Result<WorkerGuard> {
        let dir = log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("creating log directory {:?}", dir))?;
        let name = log_file
            .file_name()
            .with_context(|| format!("log path {:?} has no file name", log_file))?;

        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let default_level = if verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .with(verbose.then(|| fmt::layer().with_writer(io::stderr)))
            .try_init()
            .context("installing tracing subscriber")?;

        Ok(guard)
    }

    /// Lines of the log file; a missing file reads as empty.
    pub fn read_log(path: &Path) -> Result<Vec<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err).with_context(|| format!("reading log {:?}", path)),
        }
    }

    pub fn clear_log(path: &Path) -> Result<()> {
        File::create(path).with_context(|| format!("clearing log {:?}", path))?;
        Ok(())
    }

}
