use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// The type of an ID data-block, identified in the file by the two letter code of its block
/// (`b"ME"` for meshes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdCode {
    Scene,
    Library,
    Object,
    Mesh,
    Curve,
    MetaBall,
    Material,
    Texture,
    Image,
    Lattice,
    Light,
    Camera,
    ShapeKey,
    World,
    Screen,
    VFont,
    Text,
    Speaker,
    Sound,
    Collection,
    Armature,
    Action,
    NodeTree,
    Brush,
    ParticleSettings,
    GreasePencil,
    WindowManager,
    MovieClip,
    Mask,
    LineStyle,
    Palette,
    PaintCurve,
    CacheFile,
    WorkSpace,
    LightProbe,
    Curves,
    PointCloud,
    Volume,
}

impl IdCode {
    /// Every type, in the order libraries are scanned when listing their content.
    pub const ALL: [IdCode; 38] = [
        IdCode::Library,
        IdCode::Scene,
        IdCode::Object,
        IdCode::Mesh,
        IdCode::Curve,
        IdCode::MetaBall,
        IdCode::Material,
        IdCode::Texture,
        IdCode::Image,
        IdCode::Lattice,
        IdCode::Light,
        IdCode::Camera,
        IdCode::ShapeKey,
        IdCode::World,
        IdCode::Screen,
        IdCode::VFont,
        IdCode::Text,
        IdCode::Speaker,
        IdCode::Sound,
        IdCode::Collection,
        IdCode::Armature,
        IdCode::Action,
        IdCode::NodeTree,
        IdCode::Brush,
        IdCode::ParticleSettings,
        IdCode::GreasePencil,
        IdCode::WindowManager,
        IdCode::MovieClip,
        IdCode::Mask,
        IdCode::LineStyle,
        IdCode::Palette,
        IdCode::PaintCurve,
        IdCode::CacheFile,
        IdCode::WorkSpace,
        IdCode::LightProbe,
        IdCode::Curves,
        IdCode::PointCloud,
        IdCode::Volume,
    ];

    /// The two letter code used for blocks and as the prefix of ID names.
    pub fn code(self) -> [u8; 2] {
        match self {
            IdCode::Scene => *b"SC",
            IdCode::Library => *b"LI",
            IdCode::Object => *b"OB",
            IdCode::Mesh => *b"ME",
            IdCode::Curve => *b"CU",
            IdCode::MetaBall => *b"MB",
            IdCode::Material => *b"MA",
            IdCode::Texture => *b"TE",
            IdCode::Image => *b"IM",
            IdCode::Lattice => *b"LT",
            IdCode::Light => *b"LA",
            IdCode::Camera => *b"CA",
            IdCode::ShapeKey => *b"KE",
            IdCode::World => *b"WO",
            IdCode::Screen => *b"SR",
            IdCode::VFont => *b"VF",
            IdCode::Text => *b"TX",
            IdCode::Speaker => *b"SK",
            IdCode::Sound => *b"SO",
            IdCode::Collection => *b"GR",
            IdCode::Armature => *b"AR",
            IdCode::Action => *b"AC",
            IdCode::NodeTree => *b"NT",
            IdCode::Brush => *b"BR",
            IdCode::ParticleSettings => *b"PA",
            IdCode::GreasePencil => *b"GD",
            IdCode::WindowManager => *b"WM",
            IdCode::MovieClip => *b"MC",
            IdCode::Mask => *b"MS",
            IdCode::LineStyle => *b"LS",
            IdCode::Palette => *b"PL",
            IdCode::PaintCurve => *b"PC",
            IdCode::CacheFile => *b"CF",
            IdCode::WorkSpace => *b"WS",
            IdCode::LightProbe => *b"LP",
            IdCode::Curves => *b"CV",
            IdCode::PointCloud => *b"PT",
            IdCode::Volume => *b"VO",
        }
    }

    pub fn from_code(code: [u8; 2]) -> Option<IdCode> {
        IdCode::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// The name of the SDNA struct data-blocks of this type are stored as.
    pub fn struct_name(self) -> &'static str {
        match self {
            IdCode::Scene => "Scene",
            IdCode::Library => "Library",
            IdCode::Object => "Object",
            IdCode::Mesh => "Mesh",
            IdCode::Curve => "Curve",
            IdCode::MetaBall => "MetaBall",
            IdCode::Material => "Material",
            IdCode::Texture => "Tex",
            IdCode::Image => "Image",
            IdCode::Lattice => "Lattice",
            IdCode::Light => "Light",
            IdCode::Camera => "Camera",
            IdCode::ShapeKey => "Key",
            IdCode::World => "World",
            IdCode::Screen => "bScreen",
            IdCode::VFont => "VFont",
            IdCode::Text => "Text",
            IdCode::Speaker => "Speaker",
            IdCode::Sound => "bSound",
            IdCode::Collection => "Collection",
            IdCode::Armature => "bArmature",
            IdCode::Action => "bAction",
            IdCode::NodeTree => "bNodeTree",
            IdCode::Brush => "Brush",
            IdCode::ParticleSettings => "ParticleSettings",
            IdCode::GreasePencil => "bGPdata",
            IdCode::WindowManager => "wmWindowManager",
            IdCode::MovieClip => "MovieClip",
            IdCode::Mask => "Mask",
            IdCode::LineStyle => "FreestyleLineStyle",
            IdCode::Palette => "Palette",
            IdCode::PaintCurve => "PaintCurve",
            IdCode::CacheFile => "CacheFile",
            IdCode::WorkSpace => "WorkSpace",
            IdCode::LightProbe => "LightProbe",
            IdCode::Curves => "Curves",
            IdCode::PointCloud => "PointCloud",
            IdCode::Volume => "Volume",
        }
    }

    /// Whether data-blocks of this type can be linked from another file at all.
    pub fn is_linkable(self) -> bool {
        !matches!(
            self,
            IdCode::Library | IdCode::Screen | IdCode::WindowManager | IdCode::ShapeKey
        )
    }

    /// Types whose local copies can be reused by later appends of the same library data instead of
    /// appending another copy.
    pub fn append_is_reusable(self) -> bool {
        matches!(
            self,
            IdCode::Material
                | IdCode::Texture
                | IdCode::Image
                | IdCode::NodeTree
                | IdCode::World
                | IdCode::Brush
                | IdCode::Palette
                | IdCode::PaintCurve
                | IdCode::LineStyle
                | IdCode::Sound
                | IdCode::VFont
        )
    }

    /// Objects and collections are kept alive by the scene hierarchy, the other types need a fake
    /// user when appended with `APPEND_SET_FAKEUSER`.
    pub fn uses_fake_user_on_append(self) -> bool {
        !matches!(self, IdCode::Object | IdCode::Collection)
    }

    pub fn filter(self) -> IdFilter {
        match IdCode::ALL.iter().position(|&c| c == self) {
            Some(bit) => IdFilter::from_bits_truncate(1 << bit),
            None => IdFilter::empty(),
        }
    }
}

impl TryFrom<[u8; 2]> for IdCode {
    type Error = [u8; 2];

    fn try_from(code: [u8; 2]) -> Result<Self, Self::Error> {
        IdCode::from_code(code).ok_or(code)
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        write!(f, "{}{}", code[0] as char, code[1] as char)
    }
}

bitflags::bitflags! {
    /// A set of ID types. The bit of each type is its position in `IdCode::ALL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct IdFilter: u64 {
        const LI = 1 << 0;
        const SCE = 1 << 1;
        const OB = 1 << 2;
        const ME = 1 << 3;
        const CU = 1 << 4;
        const MB = 1 << 5;
        const MA = 1 << 6;
        const TE = 1 << 7;
        const IM = 1 << 8;
        const LT = 1 << 9;
        const LA = 1 << 10;
        const CA = 1 << 11;
        const KE = 1 << 12;
        const WO = 1 << 13;
        const SCR = 1 << 14;
        const VF = 1 << 15;
        const TXT = 1 << 16;
        const SPK = 1 << 17;
        const SO = 1 << 18;
        const GR = 1 << 19;
        const AR = 1 << 20;
        const AC = 1 << 21;
        const NT = 1 << 22;
        const BR = 1 << 23;
        const PA = 1 << 24;
        const GD = 1 << 25;
        const WM = 1 << 26;
        const MC = 1 << 27;
        const MSK = 1 << 28;
        const LS = 1 << 29;
        const PAL = 1 << 30;
        const PC = 1 << 31;
        const CF = 1 << 32;
        const WS = 1 << 33;
        const LP = 1 << 34;
        const CV = 1 << 35;
        const PT = 1 << 36;
        const VO = 1 << 37;
    }
}

impl IdFilter {
    /// The types of this set, in `IdCode::ALL` order.
    pub fn codes(self) -> impl Iterator<Item = IdCode> {
        IdCode::ALL
            .iter()
            .copied()
            .filter(move |c| self.contains(c.filter()))
    }
}

impl From<IdCode> for IdFilter {
    fn from(code: IdCode) -> Self {
        code.filter()
    }
}
