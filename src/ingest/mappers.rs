//! Feed DTO → store record mapping, one function per entity.
//!
//! A mapper returns `None` when the item lacks its key or another required
//! field. Text is trimmed and empty strings become `NULL`; list fields are
//! trimmed, blanks dropped and repeats removed while keeping feed order.

use chrono::NaiveDate;

use super::{ParentRef, ParentRefs};
use crate::database_ops::entities::{
    Category, Channel, Country, Guide, Language, Programme, Region, Stream, Subdivision,
};
use crate::feed::{
    CategoryDto, ChannelDto, CountryDto, GuideDto, LanguageDto, RegionDto, StreamDto, SubdivisionDto,
};

fn required(raw: String) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        None
    } else if t.len() == raw.len() {
        Some(raw)
    } else {
        Some(t.to_string())
    }
}

fn optional(raw: Option<String>) -> Option<String> {
    raw.and_then(required)
}

fn list(raw: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw.into_iter().filter_map(required) {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Keep ISO dates only; anything unparseable is dropped rather than stored.
fn iso_date(raw: Option<String>) -> Option<String> {
    let raw = optional(raw)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

pub fn language(dto: LanguageDto) -> Option<Language> {
    Some(Language {
        code: required(dto.code)?,
        name: required(dto.name)?,
    })
}

pub fn country(dto: CountryDto) -> Option<Country> {
    Some(Country {
        code: required(dto.code)?,
        name: required(dto.name)?,
        flag: optional(dto.flag),
        languages: list(dto.languages),
    })
}

pub fn region(dto: RegionDto) -> Option<Region> {
    Some(Region {
        code: required(dto.code)?,
        name: required(dto.name)?,
        countries: list(dto.countries),
    })
}

pub fn subdivision(dto: SubdivisionDto) -> Option<Subdivision> {
    Some(Subdivision {
        code: required(dto.code)?,
        country: required(dto.country)?,
        name: required(dto.name)?,
    })
}

pub fn category(dto: CategoryDto) -> Option<Category> {
    Some(Category {
        id: required(dto.id)?,
        name: required(dto.name)?,
    })
}

pub fn channel(dto: ChannelDto) -> Option<Channel> {
    let id = required(dto.id)?;
    let replaced_by = optional(dto.replaced_by).filter(|r| *r != id);
    Some(Channel {
        name: required(dto.name)?,
        network: optional(dto.network),
        country: optional(dto.country),
        subdivision: optional(dto.subdivision),
        city: optional(dto.city),
        is_nsfw: dto.is_nsfw,
        launched: iso_date(dto.launched),
        closed: iso_date(dto.closed),
        replaced_by,
        website: optional(dto.website),
        logo: optional(dto.logo),
        catchup_enabled: false,
        alt_names: list(dto.alt_names),
        owners: list(dto.owners),
        broadcast_area: list(dto.broadcast_area),
        languages: list(dto.languages),
        categories: list(dto.categories),
        id,
    })
}

pub fn stream(dto: StreamDto) -> Option<Stream> {
    Some(Stream {
        url: required(dto.url)?,
        channel: optional(dto.channel),
        title: optional(dto.title),
        quality: optional(dto.quality),
        referrer: optional(dto.referrer),
        user_agent: optional(dto.user_agent),
    })
}

pub fn guide(dto: GuideDto) -> Option<Guide> {
    let site = required(dto.site)?.to_ascii_lowercase();
    let site_id = required(dto.site_id)?;
    let lang = required(dto.lang)?.to_ascii_lowercase();
    Some(Guide {
        id: Guide::compose_id(&site, &site_id, &lang),
        channel: optional(dto.channel),
        site_name: optional(Some(dto.site_name)).unwrap_or_else(|| site_id.clone()),
        site,
        site_id,
        lang,
    })
}

impl ParentRefs for Language {}
impl ParentRefs for Country {}
impl ParentRefs for Region {}
impl ParentRefs for Category {}

impl ParentRefs for Subdivision {
    fn required_parents(&self) -> Vec<ParentRef<'_>> {
        vec![ParentRef::new("countries", "code", &self.country)]
    }
}

impl ParentRefs for Channel {
    fn required_parents(&self) -> Vec<ParentRef<'_>> {
        let mut refs = Vec::new();
        if let Some(country) = &self.country {
            refs.push(ParentRef::new("countries", "code", country));
        }
        if let Some(subdivision) = &self.subdivision {
            refs.push(ParentRef::new("subdivisions", "code", subdivision));
        }
        refs
    }
}

impl ParentRefs for Stream {
    fn required_parents(&self) -> Vec<ParentRef<'_>> {
        self.channel
            .iter()
            .map(|c| ParentRef::new("channels", "id", c))
            .collect()
    }
}

impl ParentRefs for Guide {
    fn required_parents(&self) -> Vec<ParentRef<'_>> {
        self.channel
            .iter()
            .map(|c| ParentRef::new("channels", "id", c))
            .collect()
    }
}

impl ParentRefs for Programme {
    fn required_parents(&self) -> Vec<ParentRef<'_>> {
        vec![ParentRef::new("channels", "id", &self.channel)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mapping_normalises_text_lists_and_dates() {
        let dto = ChannelDto {
            id: " BBCOne.uk ".into(),
            name: "BBC One".into(),
            network: Some("  ".into()),
            country: Some("UK".into()),
            categories: vec!["general".into(), " general ".into(), "".into()],
            launched: Some("1936-11-02".into()),
            closed: Some("sometime".into()),
            replaced_by: Some("BBCOne.uk".into()),
            ..ChannelDto::default()
        };
        let ch = channel(dto).unwrap();
        assert_eq!(ch.id, "BBCOne.uk");
        assert_eq!(ch.network, None);
        assert_eq!(ch.categories, vec!["general"]);
        assert_eq!(ch.launched.as_deref(), Some("1936-11-02"));
        assert_eq!(ch.closed, None);
        // a channel cannot replace itself
        assert_eq!(ch.replaced_by, None);
        assert!(!ch.catchup_enabled);
    }

    #[test]
    fn records_without_key_are_rejected() {
        assert!(category(CategoryDto {
            id: "  ".into(),
            name: "News".into(),
        })
        .is_none());
        assert!(stream(StreamDto {
            url: String::new(),
            ..StreamDto::default()
        })
        .is_none());
    }

    #[test]
    fn guide_id_is_composed_from_site_site_id_and_lang() {
        let g = guide(GuideDto {
            channel: Some("A.us".into()),
            site: "tv.com".into(),
            site_id: "42".into(),
            site_name: "".into(),
            lang: "EN".into(),
        })
        .unwrap();
        assert_eq!(g.id, "tv.com/42/en");
        assert_eq!(g.site_name, "42");
    }

    #[test]
    fn guide_site_is_folded_to_lowercase() {
        let g = guide(GuideDto {
            channel: Some("A.us".into()),
            site: " TV.com ".into(),
            site_id: "42".into(),
            site_name: "A".into(),
            lang: "en".into(),
        })
        .unwrap();
        assert_eq!(g.site, "tv.com");
        assert_eq!(g.id, "tv.com/42/en");
    }

    #[test]
    fn channel_parents_follow_optional_references() {
        let mut ch = channel(ChannelDto {
            id: "A".into(),
            name: "A".into(),
            ..ChannelDto::default()
        })
        .unwrap();
        assert!(ch.required_parents().is_empty());
        ch.subdivision = Some("US-CA".into());
        let refs = ch.required_parents();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].table, "subdivisions");
    }
}
